//! Elasticsearch lookup client.
//!
//! [`EsLookupClient`] implements [`RemoteLookupClient`] on top of a
//! [`SearchTransport`], which sends a `_search` request body to an index
//! and returns the response body. The transport owns the wire protocol
//! (HTTP, auth, node selection); this module only builds queries, parses
//! responses, and classifies failures.
//!
//! ## Queries
//!
//! - Point lookup: a `bool` query with one `term` filter per key field,
//!   `size: 1`.
//! - Full scan: `match_all` sorted on `_doc`, paged with `search_after`
//!   in pages of `fetch_size` hits.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dimlookup_core::lookup::{LookupError, LookupKey, RemoteLookupClient};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::elasticsearch::codec::scalar_to_json;
use crate::elasticsearch::options::ElasticsearchConfig;

/// One document returned by a search.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchHit {
    /// Document `_id`.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Document `_source`.
    #[serde(rename = "_source", default)]
    pub source: Value,
    /// Sort values, present when the search was sorted.
    #[serde(default)]
    pub sort: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    timed_out: bool,
    hits: HitList,
}

#[derive(Debug, Deserialize)]
struct HitList {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

/// A failed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// HTTP status, `None` when no response was received.
    pub status: Option<u16>,
    /// Error description.
    pub reason: String,
}

impl TransportError {
    /// Failure without a response (connect, reset, timeout).
    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
        }
    }

    /// Failure with an HTTP status.
    #[must_use]
    pub fn status(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.into(),
        }
    }

    /// Whether a retry may succeed: no response, request timeout, too
    /// many requests, or a server-side error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(s) => s == 408 || s == 429 || s >= 500,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.reason),
            None => write!(f, "connection error: {}", self.reason),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for LookupError {
    fn from(err: TransportError) -> Self {
        if err.is_retryable() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

/// Sends search requests to the cluster.
pub trait SearchTransport: Send + Sync + 'static {
    /// Run a `_search` on `index` with the given request body and return
    /// the response body.
    fn search(
        &self,
        index: &str,
        body: Value,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Check that the cluster is reachable. Default: always reachable.
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }
}

/// [`RemoteLookupClient`] for one Elasticsearch index.
pub struct EsLookupClient<T> {
    transport: T,
    index: String,
    fetch_size: usize,
    source_fields: Vec<String>,
    name: String,
    searches: AtomicU64,
}

impl<T: SearchTransport> EsLookupClient<T> {
    /// Create a client reading `source_fields` from `config.index`.
    #[must_use]
    pub fn new(transport: T, config: &ElasticsearchConfig, source_fields: Vec<String>) -> Self {
        Self {
            transport,
            index: config.index.clone(),
            fetch_size: config.fetch_size,
            source_fields,
            name: format!("elasticsearch:{}", config.index),
            searches: AtomicU64::new(0),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of search requests sent.
    #[must_use]
    pub fn search_count(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    /// Request body for a point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Fatal`] if the key width does not match the
    /// key fields, or [`LookupError::Codec`] for an unqueryable value.
    pub fn term_query(&self, key_fields: &[String], key: &LookupKey) -> Result<Value, LookupError> {
        if key_fields.len() != key.values().len() {
            return Err(LookupError::Fatal(format!(
                "key {key} does not match key fields {key_fields:?}"
            )));
        }
        let filters = key_fields
            .iter()
            .zip(key.values())
            .map(|(field, value)| {
                let mut term = Map::new();
                term.insert(field.clone(), scalar_to_json(value)?);
                Ok(json!({ "term": term }))
            })
            .collect::<Result<Vec<_>, LookupError>>()?;
        Ok(json!({
            "size": 1,
            "_source": self.source_fields,
            "query": { "bool": { "filter": filters } },
        }))
    }

    fn scan_query(&self, search_after: Option<&[Value]>) -> Value {
        let mut body = json!({
            "size": self.fetch_size,
            "_source": self.source_fields,
            "query": { "match_all": {} },
            "sort": ["_doc"],
        });
        if let (Some(after), Some(obj)) = (search_after, body.as_object_mut()) {
            obj.insert("search_after".to_string(), Value::Array(after.to_vec()));
        }
        body
    }

    async fn search(&self, body: Value) -> Result<Vec<SearchHit>, LookupError> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let raw = self.transport.search(&self.index, body).await?;
        let response: SearchResponse = serde_json::from_value(raw)
            .map_err(|e| LookupError::Codec(format!("malformed search response: {e}")))?;
        if response.timed_out {
            return Err(LookupError::Transient(format!(
                "search on '{}' timed out",
                self.index
            )));
        }
        Ok(response.hits.hits)
    }
}

impl<T: SearchTransport> RemoteLookupClient for EsLookupClient<T> {
    type Record = SearchHit;

    async fn fetch_by_key(
        &self,
        key_fields: &[String],
        key: &LookupKey,
    ) -> Result<Option<SearchHit>, LookupError> {
        let body = self.term_query(key_fields, key)?;
        Ok(self.search(body).await?.into_iter().next())
    }

    async fn scan_all(&self) -> Result<Vec<SearchHit>, LookupError> {
        let mut all = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;
        loop {
            let page = self.search(self.scan_query(search_after.as_deref())).await?;
            let full_page = page.len() >= self.fetch_size;
            search_after = match page.last() {
                Some(last) if full_page => {
                    if last.sort.is_empty() {
                        return Err(LookupError::Fatal(
                            "scan page is missing sort values".to_string(),
                        ));
                    }
                    Some(last.sort.clone())
                }
                _ => None,
            };
            all.extend(page);
            if search_after.is_none() {
                break;
            }
        }
        tracing::debug!(index = %self.index, documents = all.len(), "scanned index");
        Ok(all)
    }

    fn client_name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), LookupError> {
        self.transport.ping().await.map_err(LookupError::from)
    }
}

impl<T> std::fmt::Debug for EsLookupClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsLookupClient")
            .field("index", &self.index)
            .field("fetch_size", &self.fetch_size)
            .field("searches", &self.searches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport answering term and `_doc`-sorted scan queries.

    use parking_lot::Mutex;

    use super::*;

    pub(crate) struct MemoryTransport {
        pub docs: Mutex<Vec<Value>>,
        pub requests: Mutex<Vec<Value>>,
        pub failures: Mutex<Vec<TransportError>>,
    }

    impl MemoryTransport {
        pub(crate) fn new(docs: Vec<Value>) -> Self {
            Self {
                docs: Mutex::new(docs),
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        fn matches(doc: &Value, query: &Value) -> bool {
            let Some(filters) = query.pointer("/bool/filter").and_then(Value::as_array) else {
                return true;
            };
            filters.iter().all(|f| {
                f.get("term")
                    .and_then(Value::as_object)
                    .is_some_and(|term| term.iter().all(|(k, v)| doc.get(k) == Some(v)))
            })
        }

        fn respond(&self, body: &Value) -> Value {
            let docs = self.docs.lock();
            let size = body["size"].as_u64().unwrap_or(10) as usize;
            let start = body["search_after"][0].as_u64().map_or(0, |s| s as usize + 1);
            let hits: Vec<Value> = docs
                .iter()
                .enumerate()
                .filter(|(_, d)| Self::matches(d, &body["query"]))
                .skip_while(|(i, _)| *i < start)
                .take(size)
                .map(|(i, d)| json!({"_id": i.to_string(), "_source": d, "sort": [i]}))
                .collect();
            json!({"timed_out": false, "hits": {"hits": hits}})
        }
    }

    impl SearchTransport for MemoryTransport {
        async fn search(&self, _index: &str, body: Value) -> Result<Value, TransportError> {
            self.requests.lock().push(body.clone());
            if let Some(err) = self.failures.lock().pop() {
                return Err(err);
            }
            Ok(self.respond(&body))
        }
    }
}
