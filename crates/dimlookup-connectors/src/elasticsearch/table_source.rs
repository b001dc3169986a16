//! Elasticsearch table source.
//!
//! [`ElasticsearchTableSource`] is what the host planner sees: a table
//! that can be scanned in full or used as the lookup side of a join. For
//! lookups it resolves the join key columns, picks the cache strategy, and
//! hands out a [`LookupProvider`] that opens the running join.
//!
//! `ALL` caching yields a synchronous lookup function over a full mirror;
//! anything else yields an asynchronous one over a bounded LRU cache.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use dimlookup_core::lookup::{
    CacheMode, ConfigError, JoinLayout, KeyExtractor, LookupConfig, LookupRuntime,
};

use crate::elasticsearch::client::{EsLookupClient, SearchTransport};
use crate::elasticsearch::codec::JsonRowCodec;
use crate::elasticsearch::options::{
    parse_elasticsearch_options, parse_lookup_options, ElasticsearchConfig,
};
use crate::elasticsearch::schema::TableSchema;
use crate::error::ConnectorError;

/// Kinds of change a source emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChangelogMode {
    /// Inserts only.
    InsertOnly,
}

/// How the host should call the lookup function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFunctionKind {
    /// Resolves in memory; call
    /// [`try_process_cached`](dimlookup_core::lookup::LookupDispatcher::try_process_cached).
    Sync,
    /// May fetch remotely; call
    /// [`process`](dimlookup_core::lookup::LookupDispatcher::process).
    Async,
}

/// Description of the full-scan path, executed by the host's input
/// format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanDescriptor {
    /// Index to scan.
    pub index: String,
    /// Columns to read, in order.
    pub field_names: Vec<String>,
    /// Page size.
    pub fetch_size: usize,
    /// Scan parallelism.
    pub parallelism: usize,
    /// Whether the scan is bounded.
    pub bounded: bool,
}

/// Lookup-capable and scan-capable Elasticsearch table.
#[derive(Debug, Clone)]
pub struct ElasticsearchTableSource<T> {
    schema: TableSchema,
    es_config: ElasticsearchConfig,
    lookup_config: LookupConfig,
    transport: T,
}

impl<T: SearchTransport + Clone> ElasticsearchTableSource<T> {
    /// Create a source from parsed configuration.
    #[must_use]
    pub fn new(
        schema: TableSchema,
        es_config: ElasticsearchConfig,
        lookup_config: LookupConfig,
        transport: T,
    ) -> Self {
        Self {
            schema,
            es_config,
            lookup_config,
            transport,
        }
    }

    /// Create a source from `WITH (...)` options.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] for missing or invalid options.
    pub fn from_options<S: BuildHasher>(
        schema: TableSchema,
        options: &HashMap<String, String, S>,
        transport: T,
    ) -> Result<Self, ConnectorError> {
        let es_config = parse_elasticsearch_options(options)?;
        let lookup_config = parse_lookup_options(options)?;
        Ok(Self::new(schema, es_config, lookup_config, transport))
    }

    /// Human-readable description.
    #[must_use]
    pub fn summary(&self) -> &'static str {
        "Elasticsearch source."
    }

    /// The source only emits inserts.
    #[must_use]
    pub fn changelog_mode(&self) -> ChangelogMode {
        ChangelogMode::InsertOnly
    }

    /// Current physical schema.
    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Lookup settings.
    #[must_use]
    pub fn lookup_config(&self) -> &LookupConfig {
        &self.lookup_config
    }

    /// Nested projection is not supported.
    #[must_use]
    pub fn supports_nested_projection(&self) -> bool {
        false
    }

    /// Narrow the schema to the top-level columns at `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a nested or out-of-range path.
    pub fn apply_projection(&mut self, paths: &[Vec<usize>]) -> Result<(), ConnectorError> {
        self.schema = self.schema.project(paths)?;
        Ok(())
    }

    /// Describe the full-scan path.
    #[must_use]
    pub fn scan_runtime_provider(&self) -> ScanDescriptor {
        ScanDescriptor {
            index: self.es_config.index.clone(),
            field_names: self.schema.field_names(),
            fetch_size: self.es_config.fetch_size,
            parallelism: self.es_config.parallelism,
            bounded: true,
        }
    }

    /// Build the lookup function for a join on the columns at `key_paths`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] for a nested or out-of-range
    /// key path, or any error from validating the lookup configuration.
    pub fn lookup_runtime_provider(
        &self,
        key_paths: &[Vec<usize>],
    ) -> Result<LookupProvider<T>, ConnectorError> {
        let mut positions = Vec::with_capacity(key_paths.len());
        let mut key_names = Vec::with_capacity(key_paths.len());
        for path in key_paths {
            let [index] = path.as_slice() else {
                return Err(ConfigError::InvalidKey(
                    "elasticsearch only supports non-nested lookup keys".to_string(),
                )
                .into());
            };
            let field = self.schema.fields().get(*index).ok_or_else(|| {
                ConfigError::InvalidKey(format!("key column {index} out of range"))
            })?;
            positions.push(*index);
            key_names.push(field.name.clone());
        }

        let config = LookupConfig {
            key_field_names: key_names,
            ..self.lookup_config.clone()
        };
        config.validate()?;

        let kind = match config.cache_mode {
            CacheMode::All => LookupFunctionKind::Sync,
            CacheMode::Lru => LookupFunctionKind::Async,
        };
        let client = EsLookupClient::new(
            self.transport.clone(),
            &self.es_config,
            self.schema.field_names(),
        );

        Ok(LookupProvider {
            kind,
            name: self.es_config.index.clone(),
            config,
            client: Arc::new(client),
            codec: Arc::new(JsonRowCodec::new(self.schema.clone())),
            lookup_key: KeyExtractor::new(positions),
        })
    }
}

/// A configured lookup function, ready to open.
pub struct LookupProvider<T> {
    kind: LookupFunctionKind,
    name: String,
    config: LookupConfig,
    client: Arc<EsLookupClient<T>>,
    codec: Arc<JsonRowCodec>,
    lookup_key: KeyExtractor,
}

impl<T: SearchTransport> LookupProvider<T> {
    /// Whether the function is synchronous or asynchronous.
    #[must_use]
    pub fn kind(&self) -> LookupFunctionKind {
        self.kind
    }

    /// Number of parallel lookup function instances.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.config.parallelism
    }

    /// Key columns of the lookup table, in key order.
    #[must_use]
    pub fn key_names(&self) -> &[String] {
        &self.config.key_field_names
    }

    /// The resolved lookup configuration.
    #[must_use]
    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    /// Open the join. `input_key` locates the key columns in input
    /// records, in the order of [`key_names`](Self::key_names).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] if the key layout does not match or the
    /// initial mirror load fails.
    pub async fn open(
        self,
        input_key: KeyExtractor,
    ) -> Result<LookupRuntime<EsLookupClient<T>, JsonRowCodec>, ConnectorError> {
        tracing::info!(
            index = %self.name,
            cache = %self.config.cache_mode,
            keys = ?self.config.key_field_names,
            parallelism = self.config.parallelism,
            "opening elasticsearch lookup"
        );
        let layout = JoinLayout {
            input_key,
            lookup_key: self.lookup_key,
        };
        Ok(LookupRuntime::open(&self.name, &self.config, self.client, self.codec, layout).await?)
    }
}

impl<T> std::fmt::Debug for LookupProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupProvider")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("key_names", &self.config.key_field_names)
            .field("parallelism", &self.config.parallelism)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elasticsearch::client::testing::MemoryTransport;
    use crate::elasticsearch::schema::{DataType, FieldDef};

    #[derive(Clone)]
    struct Shared(Arc<MemoryTransport>);

    impl SearchTransport for Shared {
        async fn search(
            &self,
            index: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, crate::elasticsearch::client::TransportError> {
            self.0.search(index, body).await
        }
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldDef::not_null("id", DataType::Int64),
            FieldDef::new("name", DataType::Utf8),
            FieldDef::new("region", DataType::Utf8),
        ])
    }

    fn source(cache: &str) -> ElasticsearchTableSource<Shared> {
        let options: HashMap<String, String> = [
            ("hosts", "http://localhost:9200"),
            ("index", "customers"),
            ("lookup.cache", cache),
            ("lookup.parallelism", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ElasticsearchTableSource::from_options(
            schema(),
            &options,
            Shared(Arc::new(MemoryTransport::new(vec![]))),
        )
        .unwrap()
    }

    #[test]
    fn test_summary_and_changelog() {
        let s = source("LRU");
        assert_eq!(s.summary(), "Elasticsearch source.");
        assert_eq!(s.changelog_mode(), ChangelogMode::InsertOnly);
        assert!(!s.supports_nested_projection());
    }

    #[test]
    fn test_strategy_selection() {
        let all = source("ALL").lookup_runtime_provider(&[vec![0]]).unwrap();
        assert_eq!(all.kind(), LookupFunctionKind::Sync);
        assert_eq!(all.parallelism(), 3);

        let lru = source("LRU").lookup_runtime_provider(&[vec![0]]).unwrap();
        assert_eq!(lru.kind(), LookupFunctionKind::Async);
        assert_eq!(lru.key_names(), &["id".to_string()]);
    }

    #[test]
    fn test_composite_key_resolved_by_name() {
        let p = source("LRU")
            .lookup_runtime_provider(&[vec![2], vec![0]])
            .unwrap();
        assert_eq!(p.key_names(), &["region".to_string(), "id".to_string()]);
    }

    #[test]
    fn test_nested_key_rejected() {
        let err = source("LRU")
            .lookup_runtime_provider(&[vec![0, 1]])
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Config(ConfigError::InvalidKey(ref m)) if m.contains("non-nested")));

        let err = source("LRU").lookup_runtime_provider(&[vec![9]]).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(ConfigError::InvalidKey(_))));

        let err = source("LRU").lookup_runtime_provider(&[]).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(ConfigError::InvalidKey(_))));
    }

    #[test]
    fn test_projection_changes_scan_and_lookup_schema() {
        let mut s = source("LRU");
        s.apply_projection(&[vec![0], vec![2]]).unwrap();

        let scan = s.scan_runtime_provider();
        assert_eq!(scan.field_names, vec!["id", "region"]);
        assert_eq!(scan.index, "customers");
        assert!(scan.bounded);

        let p = s.lookup_runtime_provider(&[vec![1]]).unwrap();
        assert_eq!(p.key_names(), &["region".to_string()]);
    }
}
