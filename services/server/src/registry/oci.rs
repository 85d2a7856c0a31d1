//! OCI Distribution client for resolving images and pulling blobs.
//!
//! Handles anonymous bearer-token negotiation (`WWW-Authenticate: Bearer`),
//! multi-platform indexes, and digest checks on every blob it downloads.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ImageHandle, ImageReference, LayerDescriptor, Registry, RegistryError};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Target platform used to pick a manifest out of a multi-platform index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    /// Parses `os/arch` or `os/arch/variant`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(format!("invalid platform {s:?}, expected os/arch[/variant]")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Configuration for the OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Static bearer token sent to every registry. Anonymous tokens are
    /// negotiated when unset.
    pub auth_token: Option<String>,
    /// Per-request timeout, covering a full blob download.
    pub timeout: Duration,
    /// Largest blob accepted.
    pub max_blob_size: u64,
    pub platform: Platform,
    /// Registries reached over plain HTTP (e.g. "localhost:5000").
    pub insecure_registries: Vec<String>,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            timeout: Duration::from_secs(1800),   // 30 minutes
            max_blob_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            platform: Platform::default(),
            insecure_registries: Vec::new(),
        }
    }
}

/// OCI Distribution registry client.
pub struct OciRegistry {
    config: OciConfig,
    client: Client,
    /// Negotiated bearer tokens keyed by `registry/repository`.
    tokens: Mutex<HashMap<String, String>>,
}

impl OciRegistry {
    pub fn new(config: OciConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("bindrop/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Base URL for a registry host.
    pub fn registry_url(&self, registry: &str) -> String {
        if registry.starts_with("http://") || registry.starts_with("https://") {
            return registry.trim_end_matches('/').to_string();
        }
        let insecure = self.config.insecure_registries.iter().any(|r| r == registry);
        let scheme = if insecure { "http" } else { "https" };
        format!("{scheme}://{registry}")
    }

    fn manifest_url(&self, reference: &ImageReference, selector: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url(&reference.registry),
            reference.repository,
            selector
        )
    }

    fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url(&reference.registry),
            reference.repository,
            digest
        )
    }

    fn token_key(reference: &ImageReference) -> String {
        format!("{}/{}", reference.registry, reference.repository)
    }

    fn cached_token(&self, reference: &ImageReference) -> Option<String> {
        let tokens = self
            .tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens
            .get(&Self::token_key(reference))
            .cloned()
            .or_else(|| self.config.auth_token.clone())
    }

    async fn send(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = self.cached_token(reference) {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(request.send().await?)
    }

    /// GET with one round of bearer-token negotiation on 401.
    async fn get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let response = self.send(reference, url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| RegistryError::AuthRequired(reference.to_string()))?;

        debug!(realm = %challenge.realm, "Negotiating registry token");
        let token = self.fetch_token(&challenge).await?;
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(Self::token_key(reference), token);

        let response = self.send(reference, url, accept).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::AuthRequired(reference.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, RegistryError> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::AuthRequired(challenge.realm.clone()))
    }

    /// Fetch a manifest or index, returning its media type and raw bytes.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        selector: &str,
    ) -> Result<(String, Bytes), RegistryError> {
        let url = self.manifest_url(reference, selector);
        debug!(url = %url, "Pulling manifest");

        let accept = [OCI_MANIFEST, DOCKER_MANIFEST, OCI_INDEX, DOCKER_MANIFEST_LIST].join(", ");
        let response = self.get(reference, &url, Some(&accept)).await?;

        match response.status() {
            StatusCode::OK => {
                let header_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
                let body = response.bytes().await?;

                if selector.contains(':') {
                    verify_digest(selector, &body)?;
                }

                let media_type = match header_type {
                    Some(t) if t != "application/json" => t,
                    _ => {
                        let probe: MediaTypeProbe = serde_json::from_slice(&body)?;
                        probe.media_type.unwrap_or_else(|| OCI_MANIFEST.to_string())
                    }
                };
                Ok((media_type, body))
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(format!(
                "{}/{}:{}",
                reference.registry, reference.repository, selector
            ))),
            status => Err(RegistryError::UnexpectedStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    async fn fetch_blob_bytes(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Bytes, RegistryError> {
        let url = self.blob_url(reference, digest);
        let response = self.get(reference, &url, None).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                verify_digest(digest, &body)?;
                Ok(body)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(digest.to_string())),
            status => Err(RegistryError::UnexpectedStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn resolve(&self, reference: &ImageReference) -> Result<ImageHandle, RegistryError> {
        let (mut media_type, mut body) = self
            .fetch_manifest(reference, reference.selector.as_str())
            .await?;

        if media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST {
            let index: Index = serde_json::from_slice(&body)?;
            let digest = select_platform(&index, &self.config.platform)
                .ok_or_else(|| RegistryError::NoMatchingPlatform(self.config.platform.to_string()))?;
            debug!(
                digest = %digest,
                platform = %self.config.platform,
                "Selected platform manifest from index"
            );
            (media_type, body) = self.fetch_manifest(reference, &digest).await?;
        }

        if media_type != OCI_MANIFEST && media_type != DOCKER_MANIFEST {
            return Err(RegistryError::UnsupportedManifest(media_type));
        }

        let manifest: Manifest = serde_json::from_slice(&body)?;
        let config = self
            .fetch_blob_bytes(reference, &manifest.config.digest)
            .await?;

        let layers = manifest
            .layers
            .into_iter()
            .map(|l| LayerDescriptor {
                digest: l.digest,
                size: l.size,
                media_type: l.media_type,
            })
            .collect::<Vec<_>>();

        info!(
            image = %reference,
            layer_count = layers.len(),
            "Resolved image"
        );

        ImageHandle::from_config(reference.clone(), layers, manifest.config.digest, config)
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        let url = self.blob_url(reference, digest);
        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let mut response = self.get(reference, &url, None).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(RegistryError::NotFound(digest.to_string())),
            status => {
                return Err(RegistryError::UnexpectedStatus {
                    status: status.as_u16(),
                    url,
                })
            }
        }

        let limit = self.config.max_blob_size;
        if let Some(size) = response.content_length() {
            if size > limit {
                return Err(RegistryError::TooLarge { size, limit });
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Download to a temporary file, then rename.
        let temp_path = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut verifier = DigestVerifier::new(digest);
        let mut total_bytes = 0u64;

        while let Some(chunk) = response.chunk().await? {
            total_bytes += chunk.len() as u64;
            if total_bytes > limit {
                drop(file);
                tokio::fs::remove_file(&temp_path).await.ok();
                return Err(RegistryError::TooLarge {
                    size: total_bytes,
                    limit,
                });
            }
            if let Some(verifier) = verifier.as_mut() {
                verifier.update(&chunk);
            }
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        if let Some(verifier) = verifier {
            if let Err(e) = verifier.verify(digest) {
                tokio::fs::remove_file(&temp_path).await.ok();
                return Err(e);
            }
        }

        tokio::fs::rename(&temp_path, dest).await?;

        debug!(digest = %digest, size = total_bytes, "Blob downloaded");
        Ok(total_bytes)
    }
}

/// Incremental digest check shared by manifests and blobs.
///
/// sha256 and sha512 are verified; other algorithms pass through unchecked.
enum DigestVerifier {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestVerifier {
    fn new(expected: &str) -> Option<Self> {
        match expected.split_once(':').map(|(algorithm, _)| algorithm) {
            Some("sha256") => Some(Self::Sha256(Sha256::new())),
            Some("sha512") => Some(Self::Sha512(Sha512::new())),
            _ => None,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn verify(self, expected: &str) -> Result<(), RegistryError> {
        let computed = match self {
            Self::Sha256(h) => format!("sha256:{}", hex::encode(h.finalize())),
            Self::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize())),
        };
        if computed != expected {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: computed,
            });
        }
        Ok(())
    }
}

fn verify_digest(expected: &str, body: &[u8]) -> Result<(), RegistryError> {
    match DigestVerifier::new(expected) {
        Some(mut verifier) => {
            verifier.update(body);
            verifier.verify(expected)
        }
        None => Ok(()),
    }
}

fn select_platform(index: &Index, platform: &Platform) -> Option<String> {
    index
        .manifests
        .iter()
        .find(|m| {
            m.platform.as_ref().is_some_and(|p| {
                p.os == platform.os
                    && p.architecture == platform.architecture
                    && (platform.variant.is_none() || p.variant == platform.variant)
            })
        })
        .map(|m| m.digest.clone())
}

/// Parsed `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header
            .trim()
            .strip_prefix("Bearer ")
            .or_else(|| header.trim().strip_prefix("bearer "))?;

        let mut fields = HashMap::new();
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after_key) = rest.split_once('=')?;
            let after_key = after_key.trim_start();
            let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            } else {
                let end = after_key.find(',').unwrap_or(after_key.len());
                (&after_key[..end], &after_key[end..])
            };
            fields.insert(key.trim().to_ascii_lowercase(), value.to_string());
            rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        }

        Some(Self {
            realm: fields.remove("realm")?,
            service: fields.remove("service"),
            scope: fields.remove("scope"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeProbe {
    #[serde(default)]
    media_type: Option<String>,
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    size: u64,
}

/// OCI image index / Docker manifest list.
#[derive(Debug, Clone, Deserialize)]
struct Index {
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<IndexPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
struct IndexPlatform {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}
