//! Lookup cache configuration.
//!
//! [`LookupConfig`] is the full configuration surface of a lookup table:
//! cache strategy, capacity and expiry, fetch concurrency, retry policy,
//! and what to emit when a lookup fails. It is validated once, when the
//! connector is built, so invalid settings are rejected before the job
//! starts.

use std::fmt;
use std::time::Duration;

use tokio::sync::Semaphore;

/// Configuration errors detected at build time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A key field is missing, duplicated, or not a single top-level column.
    #[error("invalid lookup key: {0}")]
    InvalidKey(String),

    /// LRU capacity is zero or negative.
    #[error("lookup cache capacity must be positive, got {0}")]
    CacheExhausted(i64),

    /// Any other invalid setting.
    #[error("invalid lookup config: {0}")]
    Invalid(String),
}

/// Cache strategy for a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Complete local mirror of the remote store, reloaded periodically.
    All,
    /// Bounded LRU cache filled by on-demand remote fetches.
    #[default]
    Lru,
}

impl CacheMode {
    /// Parse a cache mode (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown modes.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "lru" => Ok(Self::Lru),
            other => Err(ConfigError::Invalid(format!(
                "unknown cache mode: '{other}' (expected: ALL, LRU)"
            ))),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Lru => write!(f, "LRU"),
        }
    }
}

/// What a record produces when its lookup fails (after retries).
///
/// `DropRecord` is the default: a record whose enrichment could not be
/// determined is not emitted at all. `NullPad` emits the record with the
/// lookup columns set to NULL, as if it had no match in a left outer join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinFailurePolicy {
    /// Emit nothing for the failed record.
    #[default]
    DropRecord,
    /// Emit the record with NULL lookup columns.
    NullPad,
}

impl JoinFailurePolicy {
    /// Parse a failure policy (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown policies.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "drop" | "drop-record" | "drop_record" => Ok(Self::DropRecord),
            "null-pad" | "null_pad" | "null" => Ok(Self::NullPad),
            other => Err(ConfigError::Invalid(format!(
                "unknown failure policy: '{other}' (expected: drop, null-pad)"
            ))),
        }
    }
}

/// Join type of the lookup join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupJoinType {
    /// Inner join: only emit records with a match.
    #[default]
    Inner,
    /// Left outer join: emit every record, NULLs for non-matches.
    LeftOuter,
}

impl LookupJoinType {
    /// Parse a join type (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown join types.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "inner" => Ok(Self::Inner),
            "left" | "left-outer" | "left_outer" => Ok(Self::LeftOuter),
            other => Err(ConfigError::Invalid(format!(
                "unknown join type: '{other}' (expected: inner, left)"
            ))),
        }
    }
}

impl fmt::Display for LookupJoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "Inner"),
            Self::LeftOuter => write!(f, "LeftOuter"),
        }
    }
}

/// Retry policy for transient remote failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = no retry).
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on each further retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Configuration for a lookup table instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupConfig {
    /// Cache strategy.
    pub cache_mode: CacheMode,
    /// Maximum number of entries in the LRU cache.
    pub lru_max_size: usize,
    /// Time-to-live of LRU entries, from insertion. `None` = never expire.
    pub ttl: Option<Duration>,
    /// Cache remote "not found" results as absent markers.
    pub cache_negative_lookups: bool,
    /// TTL for absent markers. `None` falls back to [`ttl`](Self::ttl).
    pub negative_ttl: Option<Duration>,
    /// Maximum number of remote fetches in flight at once.
    pub max_concurrent_fetches: usize,
    /// Full-mirror reload interval. `None` or zero = load once.
    pub reload_interval: Option<Duration>,
    /// Lookup table columns the join key is matched against, in key order.
    pub key_field_names: Vec<String>,
    /// Timeout for a single fetch attempt. `None` = no timeout.
    pub fetch_timeout: Option<Duration>,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Failed lookups tolerated before every further failure is fatal.
    pub error_limit: Option<u64>,
    /// What a failed lookup emits.
    pub failure_policy: JoinFailurePolicy,
    /// Join type.
    pub join_type: LookupJoinType,
    /// Fatal remote errors fail the job instead of the record.
    pub strict: bool,
    /// Parallelism of the lookup function.
    pub parallelism: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Lru,
            lru_max_size: 10_000,
            ttl: Some(Duration::from_secs(60)),
            cache_negative_lookups: false,
            negative_ttl: None,
            max_concurrent_fetches: 64,
            reload_interval: Some(Duration::from_secs(3600)),
            key_field_names: Vec::new(),
            fetch_timeout: Some(Duration::from_secs(10)),
            retry: RetryConfig::default(),
            error_limit: None,
            failure_policy: JoinFailurePolicy::DropRecord,
            join_type: LookupJoinType::Inner,
            strict: false,
            parallelism: 1,
        }
    }
}

impl LookupConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidKey`] for empty, duplicated, or nested key
    ///   fields
    /// - [`ConfigError::CacheExhausted`] for a zero LRU capacity
    /// - [`ConfigError::Invalid`] for a fetch concurrency outside
    ///   `1..=Semaphore::MAX_PERMITS`, a zero parallelism, or a zero
    ///   negative TTL
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_key_fields(&self.key_field_names)?;

        if self.cache_mode == CacheMode::Lru && self.lru_max_size == 0 {
            return Err(ConfigError::CacheExhausted(0));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_fetches > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_fetches must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.cache_negative_lookups && self.negative_ttl.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid(
                "negative_ttl must be positive; disable negative caching instead".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL applied to absent markers, or `None` when negative caching is
    /// disabled.
    ///
    /// The outer `Option` is whether negative caching is on; the inner one
    /// is the marker's TTL (`None` = never expires).
    #[must_use]
    pub fn negative_cache_ttl(&self) -> Option<Option<Duration>> {
        self.cache_negative_lookups
            .then_some(self.negative_ttl.or(self.ttl))
    }

    /// Reload interval of the full mirror, `None` when it loads only once.
    #[must_use]
    pub fn effective_reload_interval(&self) -> Option<Duration> {
        self.reload_interval.filter(|d| !d.is_zero())
    }
}

/// Check that key fields are non-empty, unique, top-level column names.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidKey`] describing the first problem.
pub fn validate_key_fields(fields: &[String]) -> Result<(), ConfigError> {
    if fields.is_empty() {
        return Err(ConfigError::InvalidKey(
            "at least one key field is required".to_string(),
        ));
    }
    for (i, field) in fields.iter().enumerate() {
        if field.trim().is_empty() {
            return Err(ConfigError::InvalidKey("empty key field name".to_string()));
        }
        if field.contains('.') {
            return Err(ConfigError::InvalidKey(format!(
                "only non-nested lookup keys are supported: '{field}'"
            )));
        }
        if fields[..i].contains(field) {
            return Err(ConfigError::InvalidKey(format!(
                "duplicate key field: '{field}'"
            )));
        }
    }
    Ok(())
}
