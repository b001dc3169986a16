//! Remote store access for lookup tables.
//!
//! [`RemoteLookupClient`] is the boundary to the external keyed store: a
//! point lookup by key for the on-demand (LRU) path and a full scan for
//! the mirror path. [`RowCodec`] turns the client's native records into
//! [`Row`]s. Both use RPITIT (Rust 1.75+) / plain generics, so the cache
//! layer is generic over them rather than boxing trait objects.

use std::future::Future;
use std::time::Duration;

use crate::lookup::row::{LookupKey, Row};

/// Errors from lookup operations.
///
/// `Clone` because a single remote fetch result is fanned out to every
/// record waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// Retryable remote failure (connection reset, overloaded node).
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// A remote call did not complete in time. Retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Non-retryable remote failure (malformed query, auth failure).
    #[error("fatal remote failure: {0}")]
    Fatal(String),

    /// A record or row could not be converted.
    #[error("codec: {0}")]
    Codec(String),

    /// The full mirror has never loaded successfully.
    #[error("no snapshot loaded: {0}")]
    NoSnapshot(String),

    /// Too many lookups failed.
    #[error("error limit exceeded: {failures} failed lookups (limit {limit})")]
    ErrorLimitExceeded {
        /// Failed lookups so far.
        failures: u64,
        /// Configured limit.
        limit: u64,
    },
}

impl LookupError {
    /// Whether a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Client for the external keyed store.
///
/// Generic code holds the client behind an `Arc` and calls it from spawned
/// tasks, so implementations must be `Send + Sync + 'static`.
pub trait RemoteLookupClient: Send + Sync + 'static {
    /// The store's native record representation.
    type Record: Send + Sync + 'static;

    /// Fetch the record whose `key_fields` equal `key`, in order.
    ///
    /// Returns `Ok(None)` when no record matches. When several records
    /// match, implementations return the first one the store yields.
    fn fetch_by_key(
        &self,
        key_fields: &[String],
        key: &LookupKey,
    ) -> impl Future<Output = Result<Option<Self::Record>, LookupError>> + Send;

    /// Read every record in the store.
    fn scan_all(&self) -> impl Future<Output = Result<Vec<Self::Record>, LookupError>> + Send;

    /// Client name for logging.
    fn client_name(&self) -> &str;

    /// Health check. Default: always healthy.
    fn health_check(&self) -> impl Future<Output = Result<(), LookupError>> + Send {
        async { Ok(()) }
    }
}

/// Converts native records of type `R` into [`Row`]s.
///
/// The output field order is fixed by the codec's target schema and
/// matches the lookup table's configured field names.
pub trait RowCodec<R>: Send + Sync + 'static {
    /// Decode one record.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Codec`] if the record does not fit the
    /// target schema.
    fn decode(&self, record: &R) -> Result<Row, LookupError>;

    /// Number of fields in decoded rows.
    fn arity(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory client used by the lookup unit tests.

    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::{Mutex, RwLock};
    use tokio::time::Instant;

    use super::*;

    /// Remote store backed by a vector of rows.
    ///
    /// Records are rows whose first field is the key. Every call is
    /// counted and logged with its start/end time, and may be delayed or
    /// failed to exercise the dispatcher.
    pub(crate) struct TestClient {
        pub rows: RwLock<Vec<Row>>,
        pub fetches: AtomicU64,
        pub scans: AtomicU64,
        pub delay: Option<Duration>,
        pub failures: Mutex<Vec<LookupError>>,
        pub scan_failures: Mutex<Vec<LookupError>>,
        pub log: Mutex<Vec<(String, Instant)>>,
    }

    impl TestClient {
        pub(crate) fn new(rows: Vec<Row>) -> Self {
            Self {
                rows: RwLock::new(rows),
                fetches: AtomicU64::new(0),
                scans: AtomicU64::new(0),
                delay: None,
                failures: Mutex::new(Vec::new()),
                scan_failures: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Queue errors returned by the next fetches, in order.
        pub(crate) fn fail_next(&self, errors: Vec<LookupError>) {
            self.failures.lock().extend(errors);
        }

        pub(crate) fn fail_next_scan(&self, error: LookupError) {
            self.scan_failures.lock().push(error);
        }

        pub(crate) fn fetch_count(&self) -> u64 {
            self.fetches.load(Ordering::SeqCst)
        }

        pub(crate) fn events(&self) -> Vec<String> {
            self.log.lock().iter().map(|(e, _)| e.clone()).collect()
        }

        pub(crate) fn event_time(&self, event: &str) -> Option<Instant> {
            self.log
                .lock()
                .iter()
                .find(|(e, _)| e == event)
                .map(|(_, t)| *t)
        }
    }

    impl RemoteLookupClient for TestClient {
        type Record = Row;

        async fn fetch_by_key(
            &self,
            _key_fields: &[String],
            key: &LookupKey,
        ) -> Result<Option<Row>, LookupError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push((format!("start {key}"), Instant::now()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().push((format!("end {key}"), Instant::now()));
            {
                let mut failures = self.failures.lock();
                if !failures.is_empty() {
                    return Err(failures.remove(0));
                }
            }
            Ok(self
                .rows
                .read()
                .iter()
                .find(|row| row.get(0) == key.values().first())
                .cloned())
        }

        async fn scan_all(&self) -> Result<Vec<Row>, LookupError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.scan_failures.lock().pop() {
                return Err(err);
            }
            Ok(self.rows.read().clone())
        }

        fn client_name(&self) -> &str {
            "test_client"
        }
    }

    /// Identity codec for [`TestClient`] records.
    pub(crate) struct RowPassthrough {
        pub arity: usize,
    }

    impl RowCodec<Row> for RowPassthrough {
        fn decode(&self, record: &Row) -> Result<Row, LookupError> {
            if record.len() == self.arity {
                Ok(record.clone())
            } else {
                Err(LookupError::Codec(format!(
                    "expected {} fields, got {}",
                    self.arity,
                    record.len()
                )))
            }
        }

        fn arity(&self) -> usize {
            self.arity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RowPassthrough, TestClient};
    use super::*;
    use crate::lookup::row::ScalarValue;

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![id.into(), name.into()])
    }

    #[test]
    fn test_transient_classification() {
        assert!(LookupError::Transient("reset".into()).is_transient());
        assert!(LookupError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!LookupError::Fatal("auth".into()).is_transient());
        assert!(!LookupError::Codec("bad".into()).is_transient());
    }

    #[tokio::test]
    async fn test_fetch_by_key_found_and_missing() {
        let client = TestClient::new(vec![row(1, "a"), row(2, "b")]);
        let fields = vec!["id".to_string()];

        let found = client
            .fetch_by_key(&fields, &LookupKey::from(ScalarValue::Int64(2)))
            .await
            .unwrap();
        assert_eq!(found, Some(row(2, "b")));

        let missing = client
            .fetch_by_key(&fields, &LookupKey::from(ScalarValue::Int64(9)))
            .await
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(client.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_health_check_default() {
        let client = TestClient::new(vec![]);
        assert!(client.health_check().await.is_ok());
    }

    #[test]
    fn test_codec_rejects_wrong_arity() {
        let codec = RowPassthrough { arity: 3 };
        assert!(codec.decode(&row(1, "a")).is_err());
        assert_eq!(codec.arity(), 3);
    }
}
