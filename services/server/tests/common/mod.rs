//! Shared fixtures: an in-memory registry and layer builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use bindrop_server::extract::ArtifactLayout;
use bindrop_server::registry::{
    ImageHandle, ImageReference, LayerDescriptor, Registry, RegistryError,
};
use bindrop_server::service::{ContentService, ContentServiceConfig};

pub const RELEASE: &str = "RELEASE.2099-01-01T00-00-00Z";

struct FakeImage {
    layers: Vec<LayerDescriptor>,
    labels: HashMap<String, String>,
}

/// Registry serving images from memory and counting traffic.
#[derive(Default)]
pub struct FakeRegistry {
    images: Mutex<HashMap<String, FakeImage>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    resolves: AtomicUsize,
    pulls: AtomicUsize,
    pull_delay: Option<Duration>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow every blob pull down so concurrent requests overlap.
    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Register an image. Each layer is `(declared size, blob bytes)`.
    pub fn add_image(&self, name: &str, labels: &[(&str, &str)], layers: Vec<(u64, Vec<u8>)>) {
        let key = ImageReference::parse(name).unwrap().to_string();
        let mut blobs = self.blobs.lock().unwrap();
        let layers = layers
            .into_iter()
            .map(|(size, data)| {
                let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
                blobs.insert(digest.clone(), data);
                LayerDescriptor {
                    digest,
                    size,
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                }
            })
            .collect();
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.images
            .lock()
            .unwrap()
            .insert(key, FakeImage { layers, labels });
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn resolve(&self, reference: &ImageReference) -> Result<ImageHandle, RegistryError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let key = reference.to_string();
        let images = self.images.lock().unwrap();
        let image = images
            .get(&key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": image.labels },
        });
        let config = Bytes::from(serde_json::to_vec(&config).unwrap());
        let config_digest = format!("sha256:{}", hex::encode(Sha256::digest(&config)));

        ImageHandle::from_config(
            reference.clone(),
            image.layers.clone(),
            config_digest,
            config,
        )
    }

    async fn pull_blob(
        &self,
        _reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(digest.to_string()))?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }
}

/// Build a gzipped tar layer from `(path, contents)` pairs.
pub fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Payload layer with the three artifacts under `dir`.
pub fn artifact_layer(dir: &str) -> Vec<u8> {
    let binary = format!("{dir}/minio");
    let checksum = format!("{dir}/minio.sha256sum");
    let signature = format!("{dir}/minio.minisig");
    layer(&[
        (binary.as_str(), b"#!/bin/sh\necho minio\n".as_slice()),
        (checksum.as_str(), b"0123abcd  minio\n".as_slice()),
        (signature.as_str(), b"untrusted comment: sig\n".as_slice()),
        ("etc/os-release", b"ID=test\n".as_slice()),
    ])
}

pub fn base_layer() -> Vec<u8> {
    layer(&[("etc/hostname", b"base\n".as_slice())])
}

/// The standard two-layer image: base (size 10) and payload (size 50).
pub fn add_minio_image(registry: &FakeRegistry, name: &str, release: &str) {
    registry.add_image(
        name,
        &[("release", release)],
        vec![(10, base_layer()), (50, artifact_layer("opt/bin"))],
    );
}

pub fn content_service(dir: &TempDir, registry: Arc<FakeRegistry>) -> ContentService {
    ContentService::new(
        ContentServiceConfig {
            base_path: dir.path().join("content"),
            cache_capacity: NonZeroUsize::new(20).unwrap(),
            cache_ttl: Duration::from_secs(600),
            layout: ArtifactLayout::default(),
        },
        registry,
    )
}

/// Sorted file names in a directory.
pub fn list_dir(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
