//! Periodic reload of a [`FullMirrorCache`].
//!
//! [`RefreshScheduler::spawn`] starts a background task that rescans the
//! remote store every `period` and swaps in the new snapshot. The first
//! tick fires one full period after spawning; the initial load is the
//! caller's job. Ticks missed while a slow reload runs are skipped rather
//! than replayed back to back.
//!
//! A failed reload keeps the previous snapshot. Progress is published on
//! a `watch` channel as [`RefreshStatus`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::lookup::mirror::FullMirrorCache;
use crate::lookup::source::{LookupError, RemoteLookupClient, RowCodec};

/// Outcome of the reloads run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStatus {
    /// Version of the snapshot being served.
    pub version: u64,
    /// Successful scheduled reloads.
    pub reloads: u64,
    /// Failed reloads since the last success.
    pub consecutive_failures: u64,
    /// Error of the most recent reload, if it failed.
    pub last_error: Option<LookupError>,
}

/// Spawns mirror reload tasks.
#[derive(Debug, Clone, Copy)]
pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Start reloading `cache` from `client` every `period`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn<C, D>(
        name: impl Into<String>,
        cache: Arc<FullMirrorCache>,
        client: Arc<C>,
        codec: Arc<D>,
        period: Duration,
    ) -> RefreshHandle
    where
        C: RemoteLookupClient,
        D: RowCodec<C::Record>,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RefreshStatus {
            version: cache.snapshot().version(),
            ..RefreshStatus::default()
        });

        tracing::debug!(table = %name, ?period, "lookup mirror refresh started");
        // Ticks are anchored here, not at the task's first poll.
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let task = tokio::spawn(run_refresh(
            name,
            cache,
            client,
            codec,
            ticker,
            status_tx,
            cancel.clone(),
        ));

        RefreshHandle {
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
            status: status_rx,
        }
    }
}

async fn run_refresh<C, D>(
    name: String,
    cache: Arc<FullMirrorCache>,
    client: Arc<C>,
    codec: Arc<D>,
    mut ticker: Interval,
    status: watch::Sender<RefreshStatus>,
    cancel: CancellationToken,
) where
    C: RemoteLookupClient,
    D: RowCodec<C::Record>,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = cache.reload(client.as_ref(), codec.as_ref()) => result,
        };

        match result {
            Ok(version) => {
                tracing::debug!(
                    table = %name,
                    version,
                    rows = cache.snapshot().len(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "lookup mirror reloaded"
                );
                status.send_modify(|s| {
                    s.version = version;
                    s.reloads += 1;
                    s.consecutive_failures = 0;
                    s.last_error = None;
                });
            }
            Err(err) => {
                tracing::warn!(
                    table = %name,
                    error = %err,
                    version = cache.snapshot().version(),
                    "lookup mirror reload failed, serving previous snapshot"
                );
                status.send_modify(|s| {
                    s.consecutive_failures += 1;
                    s.last_error = Some(err);
                });
            }
        }
    }
    tracing::debug!(table = %name, "lookup mirror refresh stopped");
}

/// Handle to a running refresh task.
///
/// Dropping the handle cancels the task; [`shutdown`](Self::shutdown)
/// also waits for it to exit.
pub struct RefreshHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: watch::Receiver<RefreshStatus>,
    _guard: DropGuard,
}

impl RefreshHandle {
    /// Latest reload status.
    #[must_use]
    pub fn status(&self) -> RefreshStatus {
        self.status.borrow().clone()
    }

    /// A receiver notified after every reload attempt.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RefreshStatus> {
        self.status.clone()
    }

    /// Stop the task and wait for it to exit. An in-flight reload is
    /// abandoned.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "lookup mirror refresh task ended abnormally");
        }
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::row::{KeyExtractor, LookupKey, Row, ScalarValue};
    use crate::lookup::source::testing::{RowPassthrough, TestClient};
    use crate::lookup::table::LookupTable;

    fn dim(id: i64) -> Row {
        Row::new(vec![id.into(), format!("d{id}").into()])
    }

    fn key(id: i64) -> LookupKey {
        LookupKey::from(ScalarValue::Int64(id))
    }

    async fn loaded(client: &TestClient) -> Arc<FullMirrorCache> {
        let cache = Arc::new(FullMirrorCache::new(KeyExtractor::new(vec![0])));
        cache
            .reload(client, &RowPassthrough { arity: 2 })
            .await
            .unwrap();
        cache
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_rows_visible_only_after_reload() {
        let client = Arc::new(TestClient::new(vec![dim(1), dim(2), dim(3)]));
        let cache = loaded(&client).await;
        let start = Instant::now();

        let handle = RefreshScheduler::spawn(
            "dim",
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::new(RowPassthrough { arity: 2 }),
            Duration::from_millis(1000),
        );
        let mut updates = handle.subscribe();

        tokio::time::advance(Duration::from_millis(500)).await;
        client.rows.write().push(dim(4));
        assert!(cache.get_cached(&key(4)).is_absent());

        tokio::time::advance(Duration::from_millis(499)).await;
        tokio::task::yield_now().await;
        assert!(cache.get_cached(&key(4)).is_absent());

        updates.changed().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert!(cache.get_cached(&key(4)).is_hit());
        assert_eq!(handle.status().version, 2);
        assert_eq!(handle.status().reloads, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reload_anchored_at_spawn() {
        let client = Arc::new(TestClient::new(vec![dim(1)]));
        let cache = loaded(&client).await;
        let start = Instant::now();

        let handle = RefreshScheduler::spawn(
            "dim",
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::new(RowPassthrough { arity: 2 }),
            Duration::from_millis(1000),
        );
        let mut updates = handle.subscribe();

        // The task is first polled well after spawn.
        tokio::time::advance(Duration::from_millis(700)).await;
        updates.changed().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert_eq!(handle.status().reloads, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_keeps_snapshot() {
        let client = Arc::new(TestClient::new(vec![dim(1)]));
        let cache = loaded(&client).await;

        let handle = RefreshScheduler::spawn(
            "dim",
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::new(RowPassthrough { arity: 2 }),
            Duration::from_secs(1),
        );
        let mut updates = handle.subscribe();

        client.rows.write().clear();
        client.fail_next_scan(LookupError::Transient("cluster red".into()));
        updates.changed().await.unwrap();

        let status = handle.status();
        assert_eq!(status.version, 1);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(
            status.last_error,
            Some(LookupError::Transient("cluster red".into()))
        );
        assert!(cache.get_cached(&key(1)).is_hit());

        // Next tick succeeds with the now-empty store.
        updates.changed().await.unwrap();
        let status = handle.status();
        assert_eq!(status.version, 2);
        assert_eq!(status.consecutive_failures, 0);
        assert!(cache.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reloads() {
        let client = Arc::new(TestClient::new(vec![dim(1)]));
        let cache = loaded(&client).await;

        let handle = RefreshScheduler::spawn(
            "dim",
            Arc::clone(&cache),
            Arc::clone(&client),
            Arc::new(RowPassthrough { arity: 2 }),
            Duration::from_secs(1),
        );
        handle.shutdown().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.snapshot().version(), 1);
        assert_eq!(client.scans.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
