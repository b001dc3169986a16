//! # Lookup Table Module
//!
//! Cache layer for lookup joins that enrich stream records with rows from
//! an external keyed store.
//!
//! ## Module Overview
//!
//! - [`row`]: `Row`, `ScalarValue`, `LookupKey`, key extraction
//! - [`source`]: `RemoteLookupClient` / `RowCodec` traits, `LookupError`
//! - [`config`]: `LookupConfig` and the cache/join enums
//! - [`table`]: `LookupTable` trait, `CacheResult`, `CacheStore`
//! - [`mirror`]: full local mirror with atomic snapshot swap
//! - [`lru_cache`]: bounded TTL-aware LRU cache and pending fetches
//! - [`dispatcher`]: per-record join, fetch dedup and backpressure
//! - [`refresh`]: periodic mirror reload
//! - [`runtime`]: wiring of all of the above at job start

pub mod config;
pub mod dispatcher;
/// Bounded LRU cache with lazy TTL expiry.
pub mod lru_cache;
/// Full mirror cache.
pub mod mirror;
pub mod refresh;
pub mod row;
pub mod runtime;
/// Remote client and codec traits.
pub mod source;
/// Lookup table trait and cache store.
pub mod table;

// Re-export commonly used types
pub use config::{
    validate_key_fields, CacheMode, ConfigError, JoinFailurePolicy, LookupConfig, LookupJoinType,
    RetryConfig,
};
pub use dispatcher::{DispatcherMetrics, LookupDispatcher};
pub use lru_cache::{
    Admission, BoundedLruCache, BoundedLruCacheConfig, FetchOutcome, LruCacheMetrics, PendingFetch,
};
pub use mirror::{FullMirrorCache, MirrorMetrics, MirrorSnapshot};
pub use refresh::{RefreshHandle, RefreshScheduler, RefreshStatus};
pub use row::{KeyExtractor, LookupKey, Row, ScalarValue};
pub use runtime::{JoinLayout, LookupRuntime, OpenError};
pub use source::{LookupError, RemoteLookupClient, RowCodec};
pub use table::{CacheResult, CacheStore, LookupTable};
