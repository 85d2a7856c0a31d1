//! Artifact extraction from container images.
//!
//! Stateless steps run in this order against a content directory
//! `{base}/{hash}`:
//!
//! 1. [`select_largest_layer`]: pick the payload layer and its content hash.
//! 2. [`materialize`]: serialize the whole image to `image.tar`, with each
//!    layer stored as `<hex>.tar.gz`.
//! 3. [`unpack_layer_blob`]: pull the selected layer blob out of `image.tar`.
//! 4. [`locate_artifacts`]: extract the binary, checksum and signature using
//!    the modern path convention, falling back to the legacy one.
//! 5. [`rename_artifacts`]: suffix each file with the validated release tag.
//! 6. [`cleanup`]: remove `image.tar` and the layer blob.
//!
//! Steps 3-6 are blocking filesystem work; [`unpack_artifacts`] runs them in
//! sequence for callers that hand them to a blocking thread.

mod archive;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::{digest_hex, ImageHandle, LayerDescriptor, Registry, RegistryError, Selector};

pub use archive::{extract_entries, is_gzip};

/// Name of the serialized image inside a content directory.
pub const IMAGE_ARCHIVE: &str = "image.tar";

pub const CHECKSUM_SUFFIX: &str = "sha256sum";
pub const SIGNATURE_SUFFIX: &str = "minisig";

/// Release tag timestamp, e.g. `2024-01-01T00-00-00Z`.
const RELEASE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";
/// Colon-delimited variant, e.g. `2024-01-01T00:00:00Z`.
const RELEASE_TIME_FORMAT_FALLBACK: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Errors from extraction steps.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image has no layers")]
    EmptyLayers,

    #[error("failed to read archive {archive}: {source}")]
    ArchiveRead {
        archive: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reached end of archive {archive} before all required entries were found (missing: {missing:?})")]
    MissingEntries { archive: PathBuf, missing: Vec<String> },

    #[error("artifacts not found under either convention: modern: {modern}; legacy: {legacy}")]
    ArtifactsNotFound {
        modern: Box<ExtractError>,
        legacy: Box<ExtractError>,
    },

    #[error("invalid release tag {tag:?}: {source}")]
    ReleaseTagFormat {
        tag: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to encode image manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path convention used to find artifacts inside the payload layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Modern,
    Legacy,
}

/// Names and locations of the three artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    /// Base file name of the binary.
    pub name: String,
    pub modern_dir: String,
    pub legacy_dir: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            name: "minio".to_string(),
            modern_dir: "opt/bin".to_string(),
            legacy_dir: "usr/bin".to_string(),
        }
    }
}

impl ArtifactLayout {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// File names as found in the image: binary, checksum, signature.
    pub fn file_names(&self) -> [String; 3] {
        [
            self.name.clone(),
            format!("{}.{CHECKSUM_SUFFIX}", self.name),
            format!("{}.{SIGNATURE_SUFFIX}", self.name),
        ]
    }

    /// Archive entry names for a convention.
    pub fn entries(&self, convention: Convention) -> Vec<String> {
        let dir = match convention {
            Convention::Modern => &self.modern_dir,
            Convention::Legacy => &self.legacy_dir,
        };
        self.file_names()
            .iter()
            .map(|file| format!("{dir}/{file}"))
            .collect()
    }

    /// Final names once suffixed with a release tag.
    pub fn descriptor(&self, release_tag: &str) -> ArtifactDescriptor {
        let binary = format!("{}.{release_tag}", self.name);
        ArtifactDescriptor {
            checksum: format!("{binary}.{CHECKSUM_SUFFIX}"),
            signature: format!("{binary}.{SIGNATURE_SUFFIX}"),
            binary,
        }
    }
}

/// Logical file names handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    #[serde(rename = "minio")]
    pub binary: String,
    #[serde(rename = "MinioSha256")]
    pub checksum: String,
    #[serde(rename = "minisig")]
    pub signature: String,
}

/// The layer chosen as payload carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedLayer {
    pub index: usize,
    pub digest: String,
    /// Digest without the algorithm prefix; names the content directory.
    pub hash: String,
    pub size: u64,
}

impl SelectedLayer {
    /// Name of the layer blob inside `image.tar`.
    pub fn blob_name(&self) -> String {
        layer_blob_name(&self.digest)
    }
}

fn layer_blob_name(digest: &str) -> String {
    format!("{}.tar.gz", digest_hex(digest))
}

/// Pick the largest layer, never the base layer when there are two or more.
///
/// Ties go to the earliest index.
pub fn select_largest_layer(layers: &[LayerDescriptor]) -> Result<SelectedLayer, ExtractError> {
    let start = if layers.len() >= 2 { 1 } else { 0 };
    let (index, layer) = layers
        .iter()
        .enumerate()
        .skip(start)
        .fold(None::<(usize, &LayerDescriptor)>, |best, (i, layer)| match best {
            Some((_, b)) if b.size >= layer.size => best,
            _ => Some((i, layer)),
        })
        .ok_or(ExtractError::EmptyLayers)?;

    Ok(SelectedLayer {
        index,
        digest: layer.digest.clone(),
        hash: layer.hex().to_string(),
        size: layer.size,
    })
}

/// Serialize the complete image into `dest/image.tar`.
///
/// The archive follows the `docker save` layout: `manifest.json`, the config
/// blob under its digest, and every layer as `<hex>.tar.gz`.
pub async fn materialize(
    registry: &dyn Registry,
    image: &ImageHandle,
    dest: &Path,
) -> Result<PathBuf, ExtractError> {
    tokio::fs::create_dir_all(dest).await.map_err(io_err(dest))?;

    let mut seen = HashSet::new();
    let mut blobs = Vec::with_capacity(image.layers.len());
    for (i, layer) in image.layers.iter().enumerate() {
        if !seen.insert(layer.digest.clone()) {
            continue;
        }
        let staging = dest.join(format!("{}.partial", layer.hex()));
        debug!(layer = i, digest = %layer.digest, size = layer.size, "Pulling layer");
        registry
            .pull_blob(&image.reference, &layer.digest, &staging)
            .await?;
        blobs.push((layer_blob_name(&layer.digest), staging));
    }

    let image = image.clone();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_image_archive(&image, &dest, &blobs))
        .await
        .map_err(|e| ExtractError::Io {
            path: PathBuf::from(IMAGE_ARCHIVE),
            source: io::Error::other(e),
        })?
}

fn write_image_archive(
    image: &ImageHandle,
    dest: &Path,
    blobs: &[(String, PathBuf)],
) -> Result<PathBuf, ExtractError> {
    let archive_path = dest.join(IMAGE_ARCHIVE);
    let file = File::create(&archive_path).map_err(io_err(&archive_path))?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let repo_tags = match &image.reference.selector {
        Selector::Tag(_) => vec![image.reference.to_string()],
        Selector::Digest(_) => Vec::new(),
    };
    let manifest = serde_json::to_vec(&serde_json::json!([{
        "Config": image.config_digest,
        "RepoTags": repo_tags,
        "Layers": image
            .layers
            .iter()
            .map(|l| layer_blob_name(&l.digest))
            .collect::<Vec<_>>(),
    }]))?;

    append_bytes(&mut builder, "manifest.json", &manifest).map_err(io_err(&archive_path))?;
    append_bytes(&mut builder, &image.config_digest, &image.config)
        .map_err(io_err(&archive_path))?;
    for (name, staging) in blobs {
        builder
            .append_path_with_name(staging, name)
            .map_err(io_err(staging))?;
        fs::remove_file(staging).map_err(io_err(staging))?;
    }

    builder
        .into_inner()
        .and_then(|mut w| io::Write::flush(&mut w))
        .map_err(io_err(&archive_path))?;

    info!(
        path = %archive_path.display(),
        layers = blobs.len(),
        "Image archive written"
    );
    Ok(archive_path)
}

fn append_bytes<W: io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

/// Extract the layer blob `nested` from `dest/image.tar` into `dest`.
pub fn unpack_layer_blob(dest: &Path, nested: &str) -> Result<PathBuf, ExtractError> {
    let mut written = extract_entries(&dest.join(IMAGE_ARCHIVE), &[nested.to_string()], dest)?;
    Ok(written.remove(0))
}

/// Extract the three artifacts from the layer blob `nested`.
///
/// The modern convention is tried first. If any of its entries is missing,
/// whatever it extracted is discarded and the legacy convention is tried
/// from scratch. Results are never mixed across conventions.
pub fn locate_artifacts(
    dest: &Path,
    nested: &str,
    layout: &ArtifactLayout,
) -> Result<Convention, ExtractError> {
    let archive = dest.join(nested);
    let discard = || {
        let partial: Vec<PathBuf> = layout.file_names().iter().map(|f| dest.join(f)).collect();
        archive::remove_files(&partial);
    };

    let modern = match extract_entries(&archive, &layout.entries(Convention::Modern), dest) {
        Ok(_) => return Ok(Convention::Modern),
        Err(e) => e,
    };
    discard();
    warn!(
        archive = %archive.display(),
        error = %modern,
        "Artifacts not found under modern layout, trying legacy"
    );

    match extract_entries(&archive, &layout.entries(Convention::Legacy), dest) {
        Ok(_) => Ok(Convention::Legacy),
        Err(legacy) => {
            discard();
            Err(ExtractError::ArtifactsNotFound {
                modern: Box::new(modern),
                legacy: Box::new(legacy),
            })
        }
    }
}

/// Parse the timestamp embedded in a release tag.
///
/// The tag is split on `.`; the timestamp is the second segment when there
/// is more than one, otherwise the only segment.
pub fn parse_release_tag(tag: &str) -> Result<DateTime<Utc>, ExtractError> {
    let segments: Vec<&str> = tag.split('.').collect();
    let candidate = if segments.len() > 1 {
        segments[1]
    } else {
        segments[0]
    };

    NaiveDateTime::parse_from_str(candidate, RELEASE_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(candidate, RELEASE_TIME_FORMAT_FALLBACK))
        .map(|t| t.and_utc())
        .map_err(|source| ExtractError::ReleaseTagFormat {
            tag: tag.to_string(),
            source,
        })
}

/// Suffix each extracted artifact with the release tag.
///
/// Renames are not rolled back: a failure part-way leaves earlier files
/// renamed.
pub fn rename_artifacts(
    dest: &Path,
    release_tag: &str,
    layout: &ArtifactLayout,
) -> Result<ArtifactDescriptor, ExtractError> {
    parse_release_tag(release_tag)?;

    let descriptor = layout.descriptor(release_tag);
    let [binary, checksum, signature] = layout.file_names();
    for (src, dst) in [
        (binary, &descriptor.binary),
        (checksum, &descriptor.checksum),
        (signature, &descriptor.signature),
    ] {
        let src = dest.join(src);
        fs::rename(&src, dest.join(dst)).map_err(io_err(&src))?;
    }
    Ok(descriptor)
}

/// Remove the layer blob and the image archive.
pub fn cleanup(dest: &Path, nested: &str) -> Result<(), ExtractError> {
    for name in [nested, IMAGE_ARCHIVE] {
        let path = dest.join(name);
        fs::remove_file(&path).map_err(io_err(&path))?;
    }
    Ok(())
}

/// Run the blocking steps: unpack, locate, rename, cleanup.
pub fn unpack_artifacts(
    dest: &Path,
    nested: &str,
    release_tag: &str,
    layout: &ArtifactLayout,
) -> Result<(Convention, ArtifactDescriptor), ExtractError> {
    unpack_layer_blob(dest, nested)?;
    let convention = locate_artifacts(dest, nested, layout)?;
    let descriptor = rename_artifacts(dest, release_tag, layout)?;
    cleanup(dest, nested)?;
    Ok((convention, descriptor))
}
