//! Cache lookup results and the cache-store abstraction.
//!
//! A [`LookupTable`] serves synchronous, in-memory lookups for a lookup
//! join. Two implementations exist, selected once from configuration and
//! wrapped in [`CacheStore`]:
//!
//! - [`FullMirrorCache`]: complete copy of the remote store. A key that is
//!   not in the mirror has no match; there is never a remote fetch.
//! - [`BoundedLruCache`]: bounded cache in front of the remote store. A
//!   [`CacheResult::Miss`] sends the dispatcher to the remote store.
//!
//! ## Lookup Flow
//!
//! 1. Stream record arrives at the dispatcher
//! 2. Dispatcher calls [`get_cached`](LookupTable::get_cached) (no I/O)
//! 3. On `Miss` (LRU only), dispatcher fetches from the remote store
//! 4. Result is joined with the record

use std::sync::Arc;

use crate::lookup::config::{CacheMode, ConfigError, LookupConfig};
use crate::lookup::lru_cache::{BoundedLruCache, BoundedLruCacheConfig};
use crate::lookup::mirror::FullMirrorCache;
use crate::lookup::row::{KeyExtractor, LookupKey, Row};

/// Result of an in-memory lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult {
    /// Key found; the matching row.
    Hit(Row),
    /// Key known to have no match (mirror miss or cached negative result).
    Absent,
    /// Key not in cache; the remote store must be asked.
    Miss,
}

impl CacheResult {
    /// Returns `true` if this is a hit.
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// Returns `true` if the key is known to be absent.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Returns `true` if the cache could not answer.
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    /// Extracts the row from a `Hit`, consuming `self`.
    #[must_use]
    pub fn into_row(self) -> Option<Row> {
        match self {
            Self::Hit(row) => Some(row),
            _ => None,
        }
    }
}

/// Synchronous in-memory lookup table.
///
/// Implementations must be `Send + Sync`: one table is shared by every
/// worker running the lookup join and by the tasks that refresh it.
pub trait LookupTable: Send + Sync {
    /// Look up a key in memory. Must not block or perform I/O.
    fn get_cached(&self, key: &LookupKey) -> CacheResult;

    /// Drop entries that can no longer be served. Returns how many were
    /// removed.
    fn maintain(&self) -> usize;

    /// Number of entries currently held.
    fn len(&self) -> usize;

    /// Whether the table is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The active cache strategy of a lookup table.
#[derive(Debug, Clone)]
pub enum CacheStore {
    /// Full local mirror.
    FullMirror(Arc<FullMirrorCache>),
    /// Bounded LRU with on-demand fetch.
    BoundedLru(Arc<BoundedLruCache>),
}

impl CacheStore {
    /// Build the store selected by `config.cache_mode`.
    ///
    /// `lookup_key` locates the key fields in lookup rows; the mirror uses
    /// it to index scanned rows.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CacheExhausted`] for a zero LRU capacity.
    pub fn from_config(
        config: &LookupConfig,
        lookup_key: KeyExtractor,
    ) -> Result<Self, ConfigError> {
        match config.cache_mode {
            CacheMode::All => Ok(Self::FullMirror(Arc::new(FullMirrorCache::new(lookup_key)))),
            CacheMode::Lru => {
                let cache = BoundedLruCache::new(BoundedLruCacheConfig::from_lookup_config(config))?;
                Ok(Self::BoundedLru(Arc::new(cache)))
            }
        }
    }

    /// The strategy of this store.
    #[must_use]
    pub fn mode(&self) -> CacheMode {
        match self {
            Self::FullMirror(_) => CacheMode::All,
            Self::BoundedLru(_) => CacheMode::Lru,
        }
    }

    /// The store as a [`LookupTable`].
    #[must_use]
    pub fn as_table(&self) -> &dyn LookupTable {
        match self {
            Self::FullMirror(cache) => cache.as_ref(),
            Self::BoundedLru(cache) => cache.as_ref(),
        }
    }
}

impl LookupTable for CacheStore {
    fn get_cached(&self, key: &LookupKey) -> CacheResult {
        self.as_table().get_cached(key)
    }

    fn maintain(&self) -> usize {
        self.as_table().maintain()
    }

    fn len(&self) -> usize {
        self.as_table().len()
    }
}
