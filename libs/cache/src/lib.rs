//! Capacity-bounded LRU cache with sliding TTL expiry.
//!
//! [`LruTtlCache`] maps keys to values with three removal paths:
//!
//! - **Eviction**: inserting past capacity drops the least recently used entry.
//! - **Expiry**: with a non-zero TTL, an entry untouched for longer than the
//!   TTL is logically absent. It is removed lazily by the lookup that notices
//!   it, or by the background sweep.
//! - **Deletion**: explicit [`LruTtlCache::delete`].
//!
//! Every successful [`LruTtlCache::get`] promotes the entry and slides its
//! expiration forward, so lookups mutate recency state. All operations,
//! lookups included, therefore run inside a single mutex; there is no
//! read-only fast path.
//!
//! # Invariants
//!
//! - Keys are unique.
//! - At most `capacity` entries are resident after any operation returns.
//! - The entry at the front of the recency list is the last to be evicted.
//! - A sweep never removes an entry refreshed after the sweep collected it.
//!
//! # Background sweep
//!
//! When the TTL is non-zero the cache spawns a sweep task on the current
//! Tokio runtime that wakes every TTL/2. [`LruTtlCache::close`] stops it;
//! dropping the cache stops it as well. Time is read from
//! [`tokio::time::Instant`], so tests can pause and advance the clock.

mod arena;

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use arena::{Node, RecencyList};

/// Lower bound for the sweep period so tiny TTLs do not spin.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct State<K, V> {
    index: HashMap<K, usize>,
    list: RecencyList<K, V>,
}

impl<K: Eq + Hash, V> State<K, V> {
    fn remove_slot(&mut self, idx: usize) -> Node<K, V> {
        let node = self.list.remove(idx);
        self.index.remove(&node.key);
        node
    }
}

struct Shared<K, V> {
    state: Mutex<State<K, V>>,
    capacity: NonZeroUsize,
    ttl: Option<Duration>,
    counters: Counters,
}

impl<K: Eq + Hash + Clone, V> Shared<K, V> {
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        // No critical section panics between relinks, so poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys whose expiration has passed at `now`.
    fn expired_candidates(&self, now: Instant) -> Vec<K> {
        let state = self.lock();
        state
            .list
            .iter()
            .filter(|(_, node)| node.is_expired(now))
            .map(|(_, node)| node.key.clone())
            .collect()
    }

    /// Remove candidates that are still expired at `now`.
    ///
    /// A candidate refreshed by a lookup since it was collected survives.
    fn remove_expired(&self, candidates: &[K], now: Instant) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        for key in candidates {
            let Some(&idx) = state.index.get(key) else {
                continue;
            };
            if state.list.node(idx).is_expired(now) {
                state.remove_slot(idx);
                removed += 1;
            }
        }
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn sweep(&self) -> usize {
        let candidates = self.expired_candidates(Instant::now());
        if candidates.is_empty() {
            return 0;
        }
        self.remove_expired(&candidates, Instant::now())
    }
}

/// Thread-safe LRU cache with optional sliding TTL.
///
/// Values are returned by clone; use cheap-to-clone values (`String`,
/// `Arc<T>`) for large payloads.
pub struct LruTtlCache<K, V> {
    shared: Arc<Shared<K, V>>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A `ttl` of [`Duration::ZERO`] disables expiry and the sweep. With a
    /// non-zero TTL the sweep is spawned on the current Tokio runtime; outside
    /// a runtime only lazy expiry applies.
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                index: HashMap::with_capacity(capacity.get() + 1),
                list: RecencyList::with_capacity(capacity.get()),
            }),
            capacity,
            ttl,
            counters: Counters::default(),
        });
        let (stop, stop_rx) = watch::channel(false);

        if let Some(ttl) = ttl {
            let period = (ttl / 2).max(MIN_SWEEP_PERIOD);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweep_loop(Arc::downgrade(&shared), period, stop_rx));
                }
                Err(_) => {
                    warn!(
                        ttl_ms = ttl.as_millis() as u64,
                        "No Tokio runtime available; cache sweep disabled, expiry stays lazy"
                    );
                }
            }
        }

        Self {
            shared,
            stop,
            closed: AtomicBool::new(false),
        }
    }
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Look up a live entry, promoting it and sliding its expiration.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut state = self.shared.lock();

        let Some(&idx) = state.index.get(key) else {
            self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if state.list.node(idx).is_expired(now) {
            state.remove_slot(idx);
            self.shared
                .counters
                .expirations
                .fetch_add(1, Ordering::Relaxed);
            self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(ttl) = self.shared.ttl {
            state.list.node_mut(idx).expires_at = Some(now + ttl);
        }
        state.list.move_to_front(idx);
        self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(state.list.node(idx).value.clone())
    }

    /// Insert or overwrite an entry and make it the most recently used.
    ///
    /// Inserting a new key into a full cache evicts exactly one entry, the
    /// least recently used.
    pub fn set(&self, key: K, value: V) {
        let expires_at = self.shared.ttl.map(|ttl| Instant::now() + ttl);
        let mut state = self.shared.lock();

        if let Some(&idx) = state.index.get(&key) {
            let node = state.list.node_mut(idx);
            node.value = value;
            node.expires_at = expires_at;
            state.list.move_to_front(idx);
            return;
        }

        let idx = state
            .list
            .push_front(Node::new(key.clone(), value, expires_at));
        state.index.insert(key, idx);

        if state.index.len() > self.shared.capacity.get() {
            if let Some(oldest) = state.list.back() {
                state.remove_slot(oldest);
                self.shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove an entry, returning its value if it was resident.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.shared.lock();
        let idx = state.index.get(key).copied()?;
        Some(state.remove_slot(idx).value)
    }

    /// Live keys, most recently used first.
    ///
    /// Does not promote or refresh anything.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        let state = self.shared.lock();
        state
            .list
            .iter()
            .filter(|(_, node)| !node.is_expired(now))
            .map(|(_, node)| node.key.clone())
            .collect()
    }

    /// Snapshot of live entries, most recently used first.
    pub fn entries(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let state = self.shared.lock();
        state
            .list
            .iter()
            .filter(|(_, node)| !node.is_expired(now))
            .map(|(_, node)| (node.key.clone(), node.value.clone()))
            .collect()
    }

    /// Number of resident entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.shared.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry now instead of waiting for the sweep.
    pub fn purge_expired(&self) -> usize {
        self.shared.sweep()
    }
}

impl<K, V> LruTtlCache<K, V> {
    pub fn capacity(&self) -> NonZeroUsize {
        self.shared.capacity
    }

    /// Configured TTL, `None` when expiry is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        self.shared.ttl
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            expirations: counters.expirations.load(Ordering::Relaxed),
        }
    }

    /// Stop the background sweep.
    ///
    /// Idempotent. The cache stays usable afterwards; expiry becomes lazy.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.send_replace(true);
        debug!("Cache sweep stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<K, V> Drop for LruTtlCache<K, V> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn sweep_loop<K, V>(
    shared: Weak<Shared<K, V>>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone,
{
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let removed = shared.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired cache entries");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}
