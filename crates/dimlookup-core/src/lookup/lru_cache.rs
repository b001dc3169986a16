//! Bounded LRU cache for on-demand lookup tables.
//!
//! [`BoundedLruCache`] holds at most `capacity` entries and evicts the
//! least-recently-used one when a new key pushes it over. Entries carry
//! their insertion time; expiry is checked lazily when an entry is read,
//! so there is no background sweeper. An expired entry reads as
//! [`CacheResult::Miss`] and is removed on the spot.
//!
//! Remote "not found" results can be cached as absent markers with their
//! own TTL, so keys known not to exist do not hit the remote store on
//! every record. This is off unless configured.
//!
//! The cache also owns the pending-fetch map: at most one in-flight fetch
//! per key. [`admit`](BoundedLruCache::admit) either resolves a key from
//! the cache, joins the key's pending fetch, or registers a new one;
//! [`complete`](BoundedLruCache::complete) stores the outcome and clears
//! the registration.
//!
//! ```text
//! get_cached(k) ── entry? ──no──▶ Miss
//!                    │yes
//!                    ▼
//!                 expired? ──yes──▶ pop, Miss
//!                    │no
//!                    ▼
//!           promote to MRU; Hit(row) | Absent
//! ```

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::lookup::config::{ConfigError, LookupConfig};
use crate::lookup::row::{LookupKey, Row};
use crate::lookup::source::LookupError;
use crate::lookup::table::{CacheResult, LookupTable};

/// Result of a remote fetch, shared by every record waiting on it.
pub type FetchOutcome = Result<Option<Row>, LookupError>;

/// An in-flight remote fetch. Clones await the same result.
pub type PendingFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// How [`BoundedLruCache::admit`] handled a key.
pub enum Admission {
    /// Answered from the cache; no fetch needed.
    Resolved(CacheResult),
    /// Another record already fetches this key.
    Joined(PendingFetch),
    /// A new fetch was registered for this key.
    Registered(PendingFetch),
}

/// Configuration for [`BoundedLruCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedLruCacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// TTL of cached rows. `None` = never expire.
    pub ttl: Option<Duration>,
    /// Whether remote misses are cached as absent markers.
    pub cache_negative: bool,
    /// TTL of absent markers. `None` = never expire.
    pub negative_ttl: Option<Duration>,
}

impl BoundedLruCacheConfig {
    /// Extract the cache settings from a [`LookupConfig`].
    #[must_use]
    pub fn from_lookup_config(config: &LookupConfig) -> Self {
        let negative = config.negative_cache_ttl();
        Self {
            capacity: config.lru_max_size,
            ttl: config.ttl,
            cache_negative: negative.is_some(),
            negative_ttl: negative.flatten(),
        }
    }
}

impl Default for BoundedLruCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Some(Duration::from_secs(60)),
            cache_negative: false,
            negative_ttl: None,
        }
    }
}

/// A cached row, or an absent marker, stamped with its insertion time.
#[derive(Debug, Clone)]
struct CachedRow {
    /// `None` marks a key the remote store does not have.
    value: Option<Row>,
    cached_at: Instant,
}

impl CachedRow {
    /// An entry is expired once `ttl` has fully elapsed since insertion.
    fn is_expired(&self, now: Instant, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(self.cached_at) >= ttl)
    }
}

/// Metrics snapshot from [`BoundedLruCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LruCacheMetrics {
    /// Reads that returned a row.
    pub hits: u64,
    /// Reads that returned an absent marker.
    pub negative_hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries evicted by capacity pressure.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Bounded, TTL-aware LRU lookup cache.
///
/// # Thread safety
///
/// All reads and writes go through one mutex around the recency list, so
/// every insert, eviction, and promotion is applied atomically. Reads
/// also take the lock because a read promotes the entry.
///
/// The pending map has its own mutex. When both are held, the pending
/// lock is taken first.
pub struct BoundedLruCache {
    entries: Mutex<LruCache<LookupKey, CachedRow>>,
    pending: Mutex<FxHashMap<LookupKey, PendingFetch>>,
    config: BoundedLruCacheConfig,
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl BoundedLruCache {
    /// Create a new cache.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CacheExhausted`] if `capacity` is zero.
    pub fn new(config: BoundedLruCacheConfig) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or(ConfigError::CacheExhausted(0))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(FxHashMap::default()),
            config,
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Whether absent markers are cached.
    #[must_use]
    pub fn caches_negative(&self) -> bool {
        self.config.cache_negative
    }

    fn ttl_for(&self, entry: &CachedRow) -> Option<Duration> {
        if entry.value.is_some() {
            self.config.ttl
        } else {
            self.config.negative_ttl
        }
    }

    /// Cache a row for `key`, replacing any previous entry.
    pub fn insert(&self, key: LookupKey, row: Row) {
        self.put(key, Some(row));
    }

    /// Cache an absent marker for `key`.
    ///
    /// Returns `false` (and caches nothing) when negative caching is off
    /// or the marker TTL is zero.
    pub fn insert_absent(&self, key: LookupKey) -> bool {
        if !self.config.cache_negative || self.config.negative_ttl.is_some_and(|d| d.is_zero()) {
            return false;
        }
        self.put(key, None);
        true
    }

    fn put(&self, key: LookupKey, value: Option<Row>) {
        let entry = CachedRow {
            value,
            cached_at: Instant::now(),
        };
        let mut entries = self.entries.lock();
        // `push` also hands back the old entry when the key was already
        // present; only a different key counts as an eviction.
        if let Some((evicted, _)) = entries.push(key, entry) {
            if !entries.contains(&evicted) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %evicted, "LRU lookup entry evicted");
            }
        }
    }

    /// Remove the entry for `key`, if any.
    pub fn invalidate(&self, key: &LookupKey) {
        self.entries.lock().pop(key);
    }

    /// Read `key` without promoting it or touching the counters.
    ///
    /// Expired entries read as `Miss` but are left in place.
    #[must_use]
    pub fn peek(&self, key: &LookupKey) -> CacheResult {
        let entries = self.entries.lock();
        match entries.peek(key) {
            Some(entry) if !entry.is_expired(Instant::now(), self.ttl_for(entry)) => {
                entry.value.clone().map_or(CacheResult::Absent, CacheResult::Hit)
            }
            _ => CacheResult::Miss,
        }
    }

    /// Route a missed key to a fetch.
    ///
    /// Joins the pending fetch for `key` if there is one. Otherwise
    /// re-checks the cache, since a fetch may have completed since the
    /// caller's miss, and only then registers the future built by `start`.
    pub fn admit(&self, key: &LookupKey, start: impl FnOnce() -> PendingFetch) -> Admission {
        let mut pending = self.pending.lock();
        if let Some(fetch) = pending.get(key) {
            return Admission::Joined(fetch.clone());
        }
        match self.peek(key) {
            CacheResult::Miss => {}
            resolved => return Admission::Resolved(resolved),
        }
        let fetch = start();
        pending.insert(key.clone(), fetch.clone());
        Admission::Registered(fetch)
    }

    /// Store the outcome of the fetch for `key` and clear its pending
    /// entry. Failures are not cached.
    pub fn complete(&self, key: &LookupKey, outcome: &FetchOutcome) {
        match outcome {
            Ok(Some(row)) => self.insert(key.clone(), row.clone()),
            Ok(None) => {
                self.insert_absent(key.clone());
            }
            Err(_) => {}
        }
        self.pending.lock().remove(key);
    }

    /// Number of keys with a fetch in flight.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of cache counters.
    #[must_use]
    pub fn metrics(&self) -> LruCacheMetrics {
        LruCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

impl LookupTable for BoundedLruCache {
    fn get_cached(&self, key: &LookupKey) -> CacheResult {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return CacheResult::Miss;
            }
            Some(entry) if !entry.is_expired(now, self.ttl_for(entry)) => {
                return match &entry.value {
                    Some(row) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        CacheResult::Hit(row.clone())
                    }
                    None => {
                        self.negative_hits.fetch_add(1, Ordering::Relaxed);
                        CacheResult::Absent
                    }
                };
            }
            Some(_) => {}
        }
        entries.pop(key);
        self.expirations.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheResult::Miss
    }

    fn maintain(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<LookupKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl_for(entry)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl std::fmt::Debug for BoundedLruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedLruCache")
            .field("capacity", &self.config.capacity)
            .field("entries", &self.entries.lock().len())
            .field("pending", &self.pending.lock().len())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
