//! Container registry access.
//!
//! The [`Registry`] trait is the seam between content extraction and the
//! network: it resolves a reference to an [`ImageHandle`] (layers and config
//! labels) and pulls individual blobs to disk. [`OciRegistry`] implements it
//! against the OCI Distribution API.

mod oci;
mod reference;

use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use oci::{OciConfig, OciRegistry, Platform};
pub use reference::{ImageReference, ReferenceError, Selector, DEFAULT_REGISTRY};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required for {0}")]
    AuthRequired(String),

    #[error("Blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unsupported manifest media type: {0}")]
    UnsupportedManifest(String),

    #[error("No manifest for platform {0}")]
    NoMatchingPlatform(String),

    #[error("Unexpected registry response {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },
}

/// One layer of an image, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Full digest, e.g. `sha256:abc...`.
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
    pub media_type: String,
}

impl LayerDescriptor {
    /// Digest without its algorithm prefix.
    pub fn hex(&self) -> &str {
        digest_hex(&self.digest)
    }
}

/// A resolved image: ordered layers plus the config blob it was built from.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub reference: ImageReference,
    pub layers: Vec<LayerDescriptor>,
    /// `config.Labels` from the image config.
    pub labels: HashMap<String, String>,
    pub config_digest: String,
    /// Raw config blob, written verbatim when the image is serialized.
    pub config: Bytes,
}

impl ImageHandle {
    /// Build a handle from a raw image config blob.
    pub fn from_config(
        reference: ImageReference,
        layers: Vec<LayerDescriptor>,
        config_digest: String,
        config: Bytes,
    ) -> Result<Self, RegistryError> {
        let parsed: ImageConfig = serde_json::from_slice(&config)?;
        let labels = parsed
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();
        Ok(Self {
            reference,
            layers,
            labels,
            config_digest,
            config,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Source of images and their blobs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to its layer list and config labels.
    async fn resolve(&self, reference: &ImageReference) -> Result<ImageHandle, RegistryError>;

    /// Download a blob to `dest`, returning the number of bytes written.
    async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64, RegistryError>;
}

/// Strip the algorithm prefix from a digest (`sha256:abc` -> `abc`).
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}
