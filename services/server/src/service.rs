//! Content retrieval: release resolution, cache gating and extraction.
//!
//! [`ContentService`] maps an image reference to a release key (from the
//! image's `release` or `version` label) and the release key to a content
//! hash (the payload layer digest) through an [`LruTtlCache`]. A cache miss
//! runs the extraction pipeline in [`crate::extract`]; only a fully
//! successful extraction populates the cache.
//!
//! Concurrent misses for the same release are serialized with per-release
//! build locks: the first caller extracts, the rest wait and then find the
//! cache populated. Extractions run on their own task, so a caller that goes
//! away does not abort one mid-flight.
//!
//! Content hashes with an extraction in progress are tracked so
//! [`ContentService::prune_orphans`] never removes a directory that is still
//! being written.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use bindrop_cache::{CacheStats, LruTtlCache};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::extract::{
    materialize, select_largest_layer, unpack_artifacts, ArtifactDescriptor, ArtifactLayout,
    ExtractError,
};
use crate::registry::{ImageHandle, ImageReference, ReferenceError, Registry, RegistryError};

/// Label holding the release tag.
pub const RELEASE_LABEL: &str = "release";
/// Label consulted when [`RELEASE_LABEL`] is absent.
pub const VERSION_LABEL: &str = "version";

/// Errors from content operations.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("image fetch failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("release tag not found")]
    MissingReleaseLabel,

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("cached content {hash} for release {release} is missing: {source}")]
    StaleCacheEntry {
        release: String,
        hash: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("extraction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration for the content service.
#[derive(Debug, Clone)]
pub struct ContentServiceConfig {
    /// Root of the content-addressed directories.
    pub base_path: PathBuf,
    pub cache_capacity: NonZeroUsize,
    /// Sliding TTL for release mappings; zero disables expiry.
    pub cache_ttl: Duration,
    pub layout: ArtifactLayout,
}

impl Default for ContentServiceConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("tmp/webhook"),
            cache_capacity: NonZeroUsize::new(20).unwrap_or(NonZeroUsize::MIN),
            cache_ttl: Duration::from_secs(600), // 10 minutes
            layout: ArtifactLayout::default(),
        }
    }
}

/// Outcome of a successful retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSet {
    pub release: String,
    /// Content hash naming the directory under the base path.
    pub hash: String,
    pub descriptor: ArtifactDescriptor,
    /// Whether the release was served from the cache.
    pub was_cached: bool,
}

struct Inner {
    base_path: PathBuf,
    layout: ArtifactLayout,
    registry: Arc<dyn Registry>,
    cache: LruTtlCache<String, String>,
    /// Per-release build locks so one extraction runs per release at a time.
    build_locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Content hashes being extracted, with the number of extractions each.
    in_flight: SyncMutex<HashMap<String, usize>>,
}

/// Resolves images to extracted release artifacts.
#[derive(Clone)]
pub struct ContentService {
    inner: Arc<Inner>,
}

impl ContentService {
    /// Create a content service.
    ///
    /// With a non-zero TTL this must be called inside a Tokio runtime so the
    /// cache sweep can be spawned.
    pub fn new(config: ContentServiceConfig, registry: Arc<dyn Registry>) -> Self {
        let cache = LruTtlCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            inner: Arc::new(Inner {
                base_path: config.base_path,
                layout: config.layout,
                registry,
                cache,
                build_locks: SyncMutex::new(HashMap::new()),
                in_flight: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    /// Resolve an image to its release artifacts, extracting them on a miss.
    #[instrument(skip(self), fields(release = tracing::field::Empty))]
    pub async fn retrieve_content(&self, image_name: &str) -> Result<ContentSet, ContentError> {
        let reference = ImageReference::parse(image_name)?;
        let image = self.inner.registry.resolve(&reference).await?;
        let release = release_key(&image.labels)?;
        tracing::Span::current().record("release", release.as_str());

        if let Some(hash) = self.inner.cache.get(&release) {
            debug!(hash = %hash, "Release cache hit");
            return self.inner.cached(release, hash).await;
        }

        let lease = Inner::lease_build_lock(&self.inner, &release);
        let guard = Arc::clone(&lease.lock).lock_owned().await;

        // Another request may have finished the extraction while we waited.
        if let Some(hash) = self.inner.cache.get(&release) {
            drop(guard);
            drop(lease);
            debug!(hash = %hash, "Release extracted by a concurrent request");
            return self.inner.cached(release, hash).await;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = inner.extract(&image, &release).await;
            drop(guard);
            drop(lease);
            result
        });
        handle.await?
    }

    /// Path of a named artifact for a cached release.
    ///
    /// Resolved from the cache alone; the file itself is not checked.
    pub fn get_binaries(&self, name: &str, release: &str) -> Result<PathBuf, ContentError> {
        if !is_plain_file_name(name) {
            return Err(ContentError::NotFound(name.to_string()));
        }
        let hash = self
            .inner
            .cache
            .get(release)
            .ok_or_else(|| ContentError::NotFound(name.to_string()))?;
        Ok(self.inner.base_path.join(hash).join(name))
    }

    /// Remove content directories no live cache entry points at.
    ///
    /// Directories with an extraction in progress are always kept, as are
    /// directories modified within `grace`.
    pub async fn prune_orphans(&self, grace: Duration) -> Result<usize, ContentError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.prune_orphans(grace)).await?
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Number of release mappings currently resident.
    pub fn cached_releases(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.inner.cache.capacity().get()
    }

    /// Stop background cache maintenance. Idempotent.
    pub fn close(&self) {
        self.inner.cache.close();
    }
}

impl Inner {
    fn lease_build_lock(inner: &Arc<Self>, release: &str) -> BuildLockLease {
        let mut locks = inner.build_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks
            .entry(release.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        BuildLockLease {
            inner: Arc::clone(inner),
            release: release.to_string(),
            lock,
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_in_flight(&self, hash: &str) -> InFlight<'_> {
        *self.lock_in_flight().entry(hash.to_string()).or_default() += 1;
        InFlight {
            inner: self,
            hash: hash.to_string(),
        }
    }

    fn is_live(&self, hash: &str) -> bool {
        self.cache.entries().iter().any(|(_, live)| live == hash)
    }

    fn prune_orphans(&self, grace: Duration) -> Result<usize, ContentError> {
        let base = &self.base_path;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ContentError::Io { path, source }
        };

        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(base)(e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(io_err(base))?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(io_err(&path))?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < grace {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            // Held through the removal so no extraction can claim the hash
            // in between. Extractions populate the cache before they stop
            // being tracked, so checking in this order leaves no gap.
            let in_flight = self.lock_in_flight();
            if in_flight.contains_key(&name) || self.is_live(&name) {
                continue;
            }
            fs::remove_dir_all(&path).map_err(io_err(&path))?;
            drop(in_flight);

            debug!(path = %path.display(), "Removed orphaned content directory");
            removed += 1;
        }

        Ok(removed)
    }

    async fn cached(&self, release: String, hash: String) -> Result<ContentSet, ContentError> {
        let dir = self.base_path.join(&hash);
        if let Err(source) = tokio::fs::metadata(&dir).await {
            warn!(
                release = %release,
                path = %dir.display(),
                "Cached release points at missing content"
            );
            return Err(ContentError::StaleCacheEntry {
                release,
                hash,
                source,
            });
        }

        Ok(ContentSet {
            descriptor: self.layout.descriptor(&release),
            release,
            hash,
            was_cached: true,
        })
    }

    async fn extract(&self, image: &ImageHandle, release: &str) -> Result<ContentSet, ContentError> {
        let start = Instant::now();
        let selected = select_largest_layer(&image.layers)?;
        let dest = self.base_path.join(&selected.hash);

        info!(
            image = %image.reference,
            hash = %selected.hash,
            layer = selected.index,
            size_bytes = selected.size,
            "Extracting release artifacts"
        );

        let _in_flight = self.track_in_flight(&selected.hash);
        materialize(self.registry.as_ref(), image, &dest).await?;

        let nested = selected.blob_name();
        let layout = self.layout.clone();
        let tag = release.to_string();
        let (convention, descriptor) = tokio::task::spawn_blocking(move || {
            unpack_artifacts(&dest, &nested, &tag, &layout)
        })
        .await??;

        self.cache.set(release.to_string(), selected.hash.clone());

        info!(
            hash = %selected.hash,
            convention = ?convention,
            duration_ms = start.elapsed().as_millis() as u64,
            "Release artifacts extracted"
        );

        Ok(ContentSet {
            release: release.to_string(),
            hash: selected.hash,
            descriptor,
            was_cached: false,
        })
    }
}

/// A build lock checked out of the per-release map.
///
/// Dropping the last lease for a release removes its map entry, including
/// when the owning request is cancelled while waiting.
struct BuildLockLease {
    inner: Arc<Inner>,
    release: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for BuildLockLease {
    fn drop(&mut self) {
        let mut locks = self
            .inner
            .build_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this lease are the only owners left.
        let ours = locks
            .get(&self.release)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock));
        if ours && Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.release);
        }
    }
}

/// Marks a content hash as being extracted until dropped.
struct InFlight<'a> {
    inner: &'a Inner,
    hash: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(count) = in_flight.get_mut(&self.hash) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.hash);
            }
        }
    }
}

/// Release key from image labels: `release`, else `version`, trimmed.
///
/// A present but blank `release` label is an error even when `version` is
/// set.
pub fn release_key(labels: &HashMap<String, String>) -> Result<String, ContentError> {
    let value = labels
        .get(RELEASE_LABEL)
        .or_else(|| labels.get(VERSION_LABEL))
        .map(|v| v.trim())
        .unwrap_or_default();
    if value.is_empty() {
        return Err(ContentError::MissingReleaseLabel);
    }
    Ok(value.to_string())
}

/// A single path component that is also safe to quote in a header.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '"'])
        && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstest::rstest;

    struct EmptyRegistry;

    #[async_trait]
    impl Registry for EmptyRegistry {
        async fn resolve(&self, reference: &ImageReference) -> Result<ImageHandle, RegistryError> {
            Err(RegistryError::NotFound(reference.to_string()))
        }

        async fn pull_blob(
            &self,
            _reference: &ImageReference,
            digest: &str,
            _dest: &Path,
        ) -> Result<u64, RegistryError> {
            Err(RegistryError::NotFound(digest.to_string()))
        }
    }

    fn service(base_path: PathBuf) -> ContentService {
        ContentService::new(
            ContentServiceConfig {
                base_path,
                cache_ttl: Duration::ZERO,
                ..ContentServiceConfig::default()
            },
            Arc::new(EmptyRegistry),
        )
    }

    fn build_lock_count(service: &ContentService) -> usize {
        service.inner.build_locks.lock().unwrap().len()
    }

    #[test]
    fn test_build_lock_entry_removed_with_last_lease() {
        let service = service(PathBuf::from("unused"));
        let first = Inner::lease_build_lock(&service.inner, "r");
        let second = Inner::lease_build_lock(&service.inner, "r");
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        assert_eq!(build_lock_count(&service), 1);

        drop(first);
        assert_eq!(build_lock_count(&service), 1);
        drop(second);
        assert_eq!(build_lock_count(&service), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_build_lock() {
        let service = service(PathBuf::from("unused"));
        let holder = Inner::lease_build_lock(&service.inner, "r");
        let guard = Arc::clone(&holder.lock).lock_owned().await;

        let inner = Arc::clone(&service.inner);
        let waiter = tokio::spawn(async move {
            let lease = Inner::lease_build_lock(&inner, "r");
            let _guard = Arc::clone(&lease.lock).lock_owned().await;
        });
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        drop(guard);
        drop(holder);
        assert_eq!(build_lock_count(&service), 0);
    }

    #[test]
    fn test_in_flight_hash_survives_prune() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(dir.path().to_path_buf());
        fs::create_dir_all(dir.path().join("busy")).unwrap();
        fs::create_dir_all(dir.path().join("idle")).unwrap();

        let first = service.inner.track_in_flight("busy");
        let second = service.inner.track_in_flight("busy");
        assert_eq!(service.inner.prune_orphans(Duration::ZERO).unwrap(), 1);
        assert!(dir.path().join("busy").exists());
        assert!(!dir.path().join("idle").exists());

        drop(first);
        assert_eq!(service.inner.prune_orphans(Duration::ZERO).unwrap(), 0);
        drop(second);
        assert!(service.inner.lock_in_flight().is_empty());
        assert_eq!(service.inner.prune_orphans(Duration::ZERO).unwrap(), 1);
        assert!(!dir.path().join("busy").exists());
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_release_key_prefers_release_label() {
        let key = release_key(&labels(&[("release", " RELEASE.X "), ("version", "v1")])).unwrap();
        assert_eq!(key, "RELEASE.X");
    }

    #[test]
    fn test_release_key_falls_back_to_version() {
        assert_eq!(release_key(&labels(&[("version", "v1")])).unwrap(), "v1");
    }

    #[test]
    fn test_release_key_missing_or_blank() {
        assert!(matches!(
            release_key(&labels(&[])),
            Err(ContentError::MissingReleaseLabel)
        ));
        assert!(matches!(
            release_key(&labels(&[("release", "  "), ("version", "v1")])),
            Err(ContentError::MissingReleaseLabel)
        ));
    }

    #[rstest]
    #[case("minio.RELEASE.2099-01-01T00-00-00Z", true)]
    #[case("minio", true)]
    #[case("", false)]
    #[case(".", false)]
    #[case("..", false)]
    #[case("a/b", false)]
    #[case("a\\b", false)]
    #[case("a\"b", false)]
    #[case("a\nb", false)]
    fn test_plain_file_name(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_plain_file_name(name), expected);
    }
}
