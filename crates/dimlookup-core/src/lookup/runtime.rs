//! Wiring of a lookup join at job start.
//!
//! [`LookupRuntime::open`] validates the configuration, builds the cache
//! store, performs the initial mirror load, and starts the refresh task.
//! The returned runtime owns the dispatcher workers use and the refresh
//! handle that [`close`](LookupRuntime::close) stops.

use std::sync::Arc;

use crate::lookup::config::{ConfigError, LookupConfig};
use crate::lookup::dispatcher::LookupDispatcher;
use crate::lookup::refresh::{RefreshHandle, RefreshScheduler, RefreshStatus};
use crate::lookup::row::KeyExtractor;
use crate::lookup::source::{LookupError, RemoteLookupClient, RowCodec};
use crate::lookup::table::CacheStore;

/// Field positions of the join key on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLayout {
    /// Key positions in input records.
    pub input_key: KeyExtractor,
    /// Key positions in decoded lookup rows.
    pub lookup_key: KeyExtractor,
}

/// Errors opening a lookup join.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The initial mirror load failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// A running lookup join: dispatcher plus background refresh.
pub struct LookupRuntime<C, D> {
    dispatcher: LookupDispatcher<C, D>,
    refresh: Option<RefreshHandle>,
}

impl<C, D> LookupRuntime<C, D>
where
    C: RemoteLookupClient,
    D: RowCodec<C::Record>,
{
    /// Open a lookup join.
    ///
    /// # Errors
    ///
    /// - [`OpenError::Config`] if `config` fails validation or the key
    ///   layout does not match the key fields
    /// - [`OpenError::Lookup`] with [`LookupError::NoSnapshot`] if the
    ///   initial mirror load fails; a mirror that never loaded cannot
    ///   answer lookups
    pub async fn open(
        name: &str,
        config: &LookupConfig,
        client: Arc<C>,
        codec: Arc<D>,
        layout: JoinLayout,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let key_len = config.key_field_names.len();
        if layout.input_key.positions().len() != key_len
            || layout.lookup_key.positions().len() != key_len
        {
            return Err(ConfigError::InvalidKey(format!(
                "expected {key_len} key positions on each side of the join"
            ))
            .into());
        }

        let store = CacheStore::from_config(config, layout.lookup_key)?;
        let mut refresh = None;

        if let CacheStore::FullMirror(mirror) = &store {
            let version = mirror
                .reload(client.as_ref(), codec.as_ref())
                .await
                .map_err(|err| {
                    tracing::error!(table = %name, error = %err, "initial lookup mirror load failed");
                    LookupError::NoSnapshot(format!("{name}: {err}"))
                })?;
            tracing::info!(
                table = %name,
                version,
                rows = mirror.snapshot().len(),
                "lookup mirror loaded"
            );

            if let Some(period) = config.effective_reload_interval() {
                refresh = Some(RefreshScheduler::spawn(
                    name,
                    Arc::clone(mirror),
                    Arc::clone(&client),
                    Arc::clone(&codec),
                    period,
                ));
            }
        }

        let dispatcher = LookupDispatcher::new(store, client, codec, layout.input_key, config);
        Ok(Self {
            dispatcher,
            refresh,
        })
    }

    /// The dispatcher; clone it into each worker.
    #[must_use]
    pub fn dispatcher(&self) -> &LookupDispatcher<C, D> {
        &self.dispatcher
    }

    /// Status of the mirror refresh task, if one runs.
    #[must_use]
    pub fn refresh_status(&self) -> Option<RefreshStatus> {
        self.refresh.as_ref().map(RefreshHandle::status)
    }

    /// Stop background refresh. Pending fetches are abandoned with the
    /// dispatchers that await them.
    pub async fn close(self) {
        if let Some(refresh) = self.refresh {
            refresh.shutdown().await;
        }
    }
}

impl<C, D> std::fmt::Debug for LookupRuntime<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupRuntime")
            .field("dispatcher", &self.dispatcher)
            .field("refresh", &self.refresh)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lookup::config::CacheMode;
    use crate::lookup::row::Row;
    use crate::lookup::source::testing::{RowPassthrough, TestClient};

    fn dim(id: i64) -> Row {
        Row::new(vec![id.into(), format!("d{id}").into()])
    }

    fn layout() -> JoinLayout {
        JoinLayout {
            input_key: KeyExtractor::new(vec![1]),
            lookup_key: KeyExtractor::new(vec![0]),
        }
    }

    fn config(mode: CacheMode) -> LookupConfig {
        LookupConfig {
            cache_mode: mode,
            key_field_names: vec!["id".into()],
            ..Default::default()
        }
    }

    async fn open(
        config: &LookupConfig,
        client: TestClient,
    ) -> Result<LookupRuntime<TestClient, RowPassthrough>, OpenError> {
        LookupRuntime::open(
            "dim",
            config,
            Arc::new(client),
            Arc::new(RowPassthrough { arity: 2 }),
            layout(),
        )
        .await
    }

    #[tokio::test]
    async fn test_open_all_loads_mirror() {
        let runtime = open(&config(CacheMode::All), TestClient::new(vec![dim(1), dim(2)]))
            .await
            .unwrap();
        let record = Row::new(vec![100.into(), 2.into()]);
        let out = runtime.dispatcher().try_process_cached(&record).unwrap();
        assert_eq!(out.map(|rows| rows.len()), Some(1));
        assert_eq!(runtime.refresh_status().map(|s| s.version), Some(1));
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_open_all_without_reload_interval() {
        let mut cfg = config(CacheMode::All);
        cfg.reload_interval = Some(Duration::ZERO);
        let runtime = open(&cfg, TestClient::new(vec![dim(1)])).await.unwrap();
        assert!(runtime.refresh_status().is_none());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_initial_load_failure_is_fatal() {
        let client = TestClient::new(vec![dim(1)]);
        client.fail_next_scan(LookupError::Fatal("index missing".into()));
        let err = open(&config(CacheMode::All), client).await.unwrap_err();
        assert!(matches!(err, OpenError::Lookup(LookupError::NoSnapshot(_))));
    }

    #[tokio::test]
    async fn test_open_lru_fetches_on_demand() {
        let runtime = open(&config(CacheMode::Lru), TestClient::new(vec![dim(1)]))
            .await
            .unwrap();
        assert!(runtime.refresh_status().is_none());

        let record = Row::new(vec![100.into(), 1.into()]);
        assert!(runtime.dispatcher().try_process_cached(&record).unwrap().is_none());
        assert_eq!(runtime.dispatcher().process(&record).await.unwrap().len(), 1);
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_open_rejects_bad_config() {
        let mut cfg = config(CacheMode::Lru);
        cfg.lru_max_size = 0;
        let err = open(&cfg, TestClient::new(vec![])).await.unwrap_err();
        assert_eq!(err, OpenError::Config(ConfigError::CacheExhausted(0)));

        let mut cfg = config(CacheMode::Lru);
        cfg.key_field_names = vec!["id".into(), "region".into()];
        let err = open(&cfg, TestClient::new(vec![])).await.unwrap_err();
        assert!(matches!(err, OpenError::Config(ConfigError::InvalidKey(_))));
    }
}
