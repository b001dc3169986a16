//! Per-record lookup join over a [`CacheStore`].
//!
//! [`LookupDispatcher::process`] extracts the key from an input record,
//! resolves it against the cache, and emits the joined output rows.
//!
//! On an LRU miss the dispatcher fetches from the remote store:
//!
//! - **Deduplication**: concurrent misses on one key share a single remote
//!   call. The first miss spawns the fetch on its own task and registers
//!   a shared handle to it with the cache; later misses await a clone of
//!   it and all observe the same result. The task runs to completion even
//!   if every waiter is dropped, so its permit and pending entry are
//!   always released.
//! - **Backpressure**: remote calls hold a permit from a FIFO semaphore, so
//!   at most `max_concurrent_fetches` run at once and further misses queue
//!   in arrival order.
//! - **Retry**: transient failures (including timeouts) are retried with
//!   exponential backoff up to `max_retries` times.
//!
//! A completed fetch populates the cache before its pending entry is
//! removed, so a later miss either joins the pending fetch or finds the
//! cached result.
//!
//! Failed lookups are handled per record by the configured
//! [`JoinFailurePolicy`]. They fail the job only in strict mode (for
//! non-transient errors) or once the error limit is exceeded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use tokio::sync::Semaphore;

use crate::lookup::config::{JoinFailurePolicy, LookupConfig, LookupJoinType, RetryConfig};
use crate::lookup::lru_cache::{Admission, FetchOutcome};
use crate::lookup::row::{KeyExtractor, LookupKey, Row};
use crate::lookup::source::{LookupError, RemoteLookupClient, RowCodec};
use crate::lookup::table::{CacheResult, CacheStore, LookupTable};

/// Metrics snapshot from [`LookupDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherMetrics {
    /// Remote calls issued, retries included.
    pub remote_calls: u64,
    /// Remote fetches that failed terminally.
    pub remote_failures: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Misses that joined an in-flight fetch instead of issuing one.
    pub deduplicated: u64,
    /// Records whose lookup failed.
    pub failed_lookups: u64,
    /// Remote fetches currently holding a permit.
    pub inflight_fetches: usize,
    /// Keys with a pending fetch.
    pub pending_keys: usize,
}

struct Inner<C, D> {
    store: CacheStore,
    client: Arc<C>,
    codec: Arc<D>,
    input_key: KeyExtractor,
    key_fields: Vec<String>,
    lookup_arity: usize,
    permits: Semaphore,
    max_concurrent_fetches: usize,
    retry: RetryConfig,
    fetch_timeout: Option<Duration>,
    failure_policy: JoinFailurePolicy,
    join_type: LookupJoinType,
    strict: bool,
    error_limit: Option<u64>,
    remote_calls: AtomicU64,
    remote_failures: AtomicU64,
    retries: AtomicU64,
    deduplicated: AtomicU64,
    failed_lookups: AtomicU64,
}

/// Enriches input records with rows from a lookup table.
///
/// Holds no cache state of its own; the [`CacheStore`] owns entries and
/// pending fetches. Cheap to clone; clones share the store, permits, and
/// counters, so one dispatcher can be handed to every worker.
///
/// Generic over the client type `C` and codec `D` because
/// [`RemoteLookupClient`] uses RPITIT and is not dyn-compatible.
pub struct LookupDispatcher<C, D> {
    inner: Arc<Inner<C, D>>,
}

impl<C, D> Clone for LookupDispatcher<C, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, D> LookupDispatcher<C, D>
where
    C: RemoteLookupClient,
    D: RowCodec<C::Record>,
{
    /// Create a dispatcher over `store`.
    ///
    /// `input_key` locates the join key in input records, in the order of
    /// `config.key_field_names`.
    #[must_use]
    pub fn new(
        store: CacheStore,
        client: Arc<C>,
        codec: Arc<D>,
        input_key: KeyExtractor,
        config: &LookupConfig,
    ) -> Self {
        let lookup_arity = codec.arity();
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                codec,
                input_key,
                key_fields: config.key_field_names.clone(),
                lookup_arity,
                permits: Semaphore::new(config.max_concurrent_fetches),
                max_concurrent_fetches: config.max_concurrent_fetches,
                retry: config.retry.clone(),
                fetch_timeout: config.fetch_timeout,
                failure_policy: config.failure_policy,
                join_type: config.join_type,
                strict: config.strict,
                error_limit: config.error_limit,
                remote_calls: AtomicU64::new(0),
                remote_failures: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                deduplicated: AtomicU64::new(0),
                failed_lookups: AtomicU64::new(0),
            }),
        }
    }

    /// The cache this dispatcher reads.
    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Join one input record.
    ///
    /// Returns zero or one output rows. A matched record yields the input
    /// fields followed by the lookup row. An unmatched one yields nothing
    /// for an inner join and a NULL-padded row for a left outer join.
    ///
    /// # Errors
    ///
    /// Returns the lookup error in strict mode for non-transient failures,
    /// or [`LookupError::ErrorLimitExceeded`] once too many lookups failed.
    /// Other failures are absorbed by the failure policy.
    pub async fn process(&self, record: &Row) -> Result<Vec<Row>, LookupError> {
        let key = match self.inner.input_key.extract(record) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(self.inner.unmatched(record)),
            Err(err) => return self.inner.on_failure(record, None, err),
        };
        match self.lookup(&key).await {
            Ok(Some(row)) => Ok(vec![record.join(&row)]),
            Ok(None) => Ok(self.inner.unmatched(record)),
            Err(err) => self.inner.on_failure(record, Some(&key), err),
        }
    }

    /// Join one input record without remote I/O.
    ///
    /// Returns `Ok(None)` when the record needs a remote fetch (an LRU
    /// miss). A full mirror always resolves here.
    ///
    /// # Errors
    ///
    /// Same as [`process`](Self::process).
    pub fn try_process_cached(&self, record: &Row) -> Result<Option<Vec<Row>>, LookupError> {
        let key = match self.inner.input_key.extract(record) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(Some(self.inner.unmatched(record))),
            Err(err) => return self.inner.on_failure(record, None, err).map(Some),
        };
        Ok(match self.inner.store.get_cached(&key) {
            CacheResult::Hit(row) => Some(vec![record.join(&row)]),
            CacheResult::Absent => Some(self.inner.unmatched(record)),
            CacheResult::Miss => None,
        })
    }

    /// Resolve `key` to its lookup row, fetching on an LRU miss.
    ///
    /// # Errors
    ///
    /// Returns the terminal fetch error. Every caller waiting on the same
    /// fetch receives the same error.
    pub async fn lookup(&self, key: &LookupKey) -> Result<Option<Row>, LookupError> {
        match self.inner.store.get_cached(key) {
            CacheResult::Hit(row) => return Ok(Some(row)),
            CacheResult::Absent => return Ok(None),
            CacheResult::Miss => {}
        }
        let CacheStore::BoundedLru(cache) = &self.inner.store else {
            // The mirror answers every key.
            return Ok(None);
        };

        let admission = cache.admit(key, || {
            tokio::spawn(Inner::run_fetch(Arc::clone(&self.inner), key.clone()))
                .map(|joined| {
                    joined.unwrap_or_else(|err| {
                        Err(LookupError::Fatal(format!("lookup fetch task failed: {err}")))
                    })
                })
                .boxed()
                .shared()
        });
        match admission {
            Admission::Resolved(result) => Ok(result.into_row()),
            Admission::Joined(fetch) => {
                self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
                fetch.await
            }
            Admission::Registered(fetch) => fetch.await,
        }
    }

    /// Snapshot of dispatcher counters.
    #[must_use]
    pub fn metrics(&self) -> DispatcherMetrics {
        let inner = &self.inner;
        DispatcherMetrics {
            remote_calls: inner.remote_calls.load(Ordering::Relaxed),
            remote_failures: inner.remote_failures.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            deduplicated: inner.deduplicated.load(Ordering::Relaxed),
            failed_lookups: inner.failed_lookups.load(Ordering::Relaxed),
            inflight_fetches: inner.max_concurrent_fetches - inner.permits.available_permits(),
            pending_keys: match &inner.store {
                CacheStore::BoundedLru(cache) => cache.pending_len(),
                CacheStore::FullMirror(_) => 0,
            },
        }
    }
}

impl<C, D> Inner<C, D>
where
    C: RemoteLookupClient,
    D: RowCodec<C::Record>,
{
    /// Fetch `key`, then cache the outcome and clear the pending entry.
    async fn run_fetch(inner: Arc<Self>, key: LookupKey) -> FetchOutcome {
        let outcome = inner.fetch_remote(&key).await;
        if let CacheStore::BoundedLru(cache) = &inner.store {
            cache.complete(&key, &outcome);
        }
        outcome
    }

    async fn fetch_remote(&self, key: &LookupKey) -> FetchOutcome {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LookupError::Fatal("fetch semaphore closed".to_string()))?;

        let mut attempt = 0u32;
        loop {
            self.remote_calls.fetch_add(1, Ordering::Relaxed);
            let call = self.client.fetch_by_key(&self.key_fields, key);
            let result = match self.fetch_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(LookupError::Timeout(limit))),
                None => call.await,
            };

            match result {
                Ok(record) => {
                    return record.map(|r| self.codec.decode(&r)).transpose();
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        client = %self.client.client_name(),
                        key = %key,
                        attempt,
                        ?backoff,
                        error = %err,
                        "retrying lookup fetch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.remote_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        client = %self.client.client_name(),
                        key = %key,
                        attempts = attempt + 1,
                        error = %err,
                        "lookup fetch failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

impl<C, D> Inner<C, D> {
    fn padded(&self, record: &Row) -> Vec<Row> {
        vec![record.join(&Row::nulls(self.lookup_arity))]
    }

    fn unmatched(&self, record: &Row) -> Vec<Row> {
        match self.join_type {
            LookupJoinType::Inner => Vec::new(),
            LookupJoinType::LeftOuter => self.padded(record),
        }
    }

    fn on_failure(
        &self,
        record: &Row,
        key: Option<&LookupKey>,
        err: LookupError,
    ) -> Result<Vec<Row>, LookupError> {
        let failures = self.failed_lookups.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(limit) = self.error_limit {
            if failures > limit {
                return Err(LookupError::ErrorLimitExceeded { failures, limit });
            }
        }
        if self.strict && !err.is_transient() {
            return Err(err);
        }

        tracing::warn!(
            key = %key.map_or_else(|| "?".to_string(), ToString::to_string),
            policy = ?self.failure_policy,
            error = %err,
            "lookup failed for record"
        );
        Ok(match self.failure_policy {
            JoinFailurePolicy::DropRecord => Vec::new(),
            JoinFailurePolicy::NullPad => self.padded(record),
        })
    }
}

impl<C, D> std::fmt::Debug for LookupDispatcher<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupDispatcher")
            .field("store", &self.inner.store)
            .field("key_fields", &self.inner.key_fields)
            .field("join_type", &self.inner.join_type)
            .field("failure_policy", &self.inner.failure_policy)
            .finish_non_exhaustive()
    }
}
