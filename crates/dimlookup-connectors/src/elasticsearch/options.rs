//! Connector `WITH (...)` options.
//!
//! [`parse_elasticsearch_options`] and [`parse_lookup_options`] map the
//! string options of an Elasticsearch table to an [`ElasticsearchConfig`]
//! and a [`LookupConfig`]. Unknown options are ignored; they may belong to
//! the host.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::str::FromStr;
use std::time::Duration;

use dimlookup_core::lookup::{
    CacheMode, ConfigError, JoinFailurePolicy, LookupConfig, LookupJoinType,
};

use crate::error::ConnectorError;

/// Cluster connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    /// Node URLs, e.g. `http://es-1:9200`.
    pub hosts: Vec<String>,
    /// Index holding the table.
    pub index: String,
    /// Basic-auth user.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Page size of full scans.
    pub fetch_size: usize,
    /// Parallelism of the scan path.
    pub parallelism: usize,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            index: String::new(),
            username: None,
            password: None,
            fetch_size: 1000,
            parallelism: 1,
        }
    }
}

impl std::fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("hosts", &self.hosts)
            .field("index", &self.index)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("fetch_size", &self.fetch_size)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl ElasticsearchConfig {
    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] if no host or index is set, a password is
    /// given without a user, or a size is zero.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.hosts.is_empty() {
            return Err(ConnectorError::MissingOption("hosts".to_string()));
        }
        if self.index.is_empty() {
            return Err(ConnectorError::MissingOption("index".to_string()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConnectorError::MissingOption("username".to_string()));
        }
        if self.fetch_size == 0 {
            return Err(ConfigError::Invalid("fetch-size must be at least 1".to_string()).into());
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be at least 1".to_string()).into());
        }
        Ok(())
    }
}

fn parse_value<T: FromStr, S: BuildHasher>(
    options: &HashMap<String, String, S>,
    key: &str,
) -> Result<Option<T>, ConnectorError> {
    options
        .get(key)
        .map(|s| {
            s.trim().parse::<T>().map_err(|_| ConnectorError::InvalidOption {
                key: key.to_string(),
                value: s.clone(),
            })
        })
        .transpose()
}

fn parse_millis<S: BuildHasher>(
    options: &HashMap<String, String, S>,
    key: &str,
) -> Result<Option<Duration>, ConnectorError> {
    Ok(parse_value::<u64, S>(options, key)?.map(Duration::from_millis))
}

fn parse_enum<T, S: BuildHasher>(
    options: &HashMap<String, String, S>,
    key: &str,
    parse: fn(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConnectorError> {
    options
        .get(key)
        .map(|s| {
            parse(s).map_err(|_| ConnectorError::InvalidOption {
                key: key.to_string(),
                value: s.clone(),
            })
        })
        .transpose()
}

/// Parse the cluster options.
///
/// # Errors
///
/// Returns [`ConnectorError`] for a missing or malformed option.
pub fn parse_elasticsearch_options<S: BuildHasher>(
    options: &HashMap<String, String, S>,
) -> Result<ElasticsearchConfig, ConnectorError> {
    let hosts = options
        .get("hosts")
        .ok_or_else(|| ConnectorError::MissingOption("hosts".to_string()))?
        .split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect();
    let index = options
        .get("index")
        .ok_or_else(|| ConnectorError::MissingOption("index".to_string()))?
        .clone();

    let defaults = ElasticsearchConfig::default();
    let config = ElasticsearchConfig {
        hosts,
        index,
        username: options.get("username").cloned(),
        password: options.get("password").cloned(),
        fetch_size: parse_value(options, "fetch-size")?.unwrap_or(defaults.fetch_size),
        parallelism: parse_value(options, "parallelism")?.unwrap_or(defaults.parallelism),
    };
    config.validate()?;
    Ok(config)
}

/// Parse the `lookup.*` options.
///
/// Key fields are not options; the caller resolves them from the join.
///
/// # Errors
///
/// Returns [`ConnectorError::InvalidOption`] for a malformed value and
/// [`ConfigError::CacheExhausted`] for a zero or negative
/// `lookup.cache.max-rows`.
pub fn parse_lookup_options<S: BuildHasher>(
    options: &HashMap<String, String, S>,
) -> Result<LookupConfig, ConnectorError> {
    let mut config = LookupConfig::default();

    if let Some(mode) = parse_enum(options, "lookup.cache", CacheMode::parse)? {
        config.cache_mode = mode;
    }
    if let Some(max_rows) = parse_value::<i64, S>(options, "lookup.cache.max-rows")? {
        config.lru_max_size = usize::try_from(max_rows)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::CacheExhausted(max_rows))?;
    }
    if let Some(ttl) = parse_millis(options, "lookup.cache.ttl")? {
        config.ttl = Some(ttl).filter(|d| !d.is_zero());
    }
    if let Some(negative) = parse_value(options, "lookup.cache.negative")? {
        config.cache_negative_lookups = negative;
    }
    if let Some(ttl) = parse_millis(options, "lookup.cache.negative-ttl")? {
        config.negative_ttl = Some(ttl);
    }
    if let Some(period) = parse_millis(options, "lookup.cache.period")? {
        config.reload_interval = Some(period);
    }
    if let Some(n) = parse_value(options, "lookup.max-concurrent-fetches")? {
        config.max_concurrent_fetches = n;
    }
    if let Some(timeout) = parse_millis(options, "lookup.async-timeout")? {
        config.fetch_timeout = Some(timeout).filter(|d| !d.is_zero());
    }
    if let Some(n) = parse_value(options, "lookup.max-retries")? {
        config.retry.max_retries = n;
    }
    if let Some(backoff) = parse_millis(options, "lookup.retry-backoff")? {
        config.retry.initial_backoff = backoff;
    }
    if let Some(limit) = parse_value::<i64, S>(options, "lookup.error-limit")? {
        // Negative means unlimited.
        config.error_limit = u64::try_from(limit).ok();
    }
    if let Some(policy) = parse_enum(options, "lookup.failure-policy", JoinFailurePolicy::parse)? {
        config.failure_policy = policy;
    }
    if let Some(strict) = parse_value(options, "lookup.strict")? {
        config.strict = strict;
    }
    if let Some(join_type) = parse_enum(options, "lookup.join-type", LookupJoinType::parse)? {
        config.join_type = join_type;
    }
    if let Some(n) = parse_value(options, "lookup.parallelism")? {
        config.parallelism = n;
    }

    Ok(config)
}
