//! Full local mirror of the remote store.
//!
//! The mirror holds an immutable [`MirrorSnapshot`] behind an
//! [`ArcSwap`]. Readers load the current snapshot without locking; a
//! reload builds a complete new snapshot off to the side and publishes it
//! with a single pointer swap. A reader therefore sees either the old
//! snapshot or the new one, never a mix.
//!
//! A failed reload leaves the current snapshot in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::lookup::row::{KeyExtractor, LookupKey, Row};
use crate::lookup::source::{LookupError, RemoteLookupClient, RowCodec};
use crate::lookup::table::{CacheResult, LookupTable};

/// One complete, immutable copy of the remote store.
#[derive(Debug)]
pub struct MirrorSnapshot {
    rows: FxHashMap<LookupKey, Row>,
    version: u64,
    loaded_at: Instant,
}

impl MirrorSnapshot {
    fn empty() -> Self {
        Self {
            rows: FxHashMap::default(),
            version: 0,
            loaded_at: Instant::now(),
        }
    }

    /// Row for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &LookupKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the snapshot has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Monotonic version; 0 means nothing has been loaded yet.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was published.
    #[must_use]
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

/// Metrics snapshot from [`FullMirrorCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MirrorMetrics {
    /// Reads that found a row.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Successful reloads.
    pub reloads: u64,
    /// Failed reloads.
    pub reload_failures: u64,
    /// Rows in the current snapshot.
    pub entries: usize,
    /// Version of the current snapshot.
    pub version: u64,
}

/// Cache holding every row of the remote store, replaced wholesale on
/// reload.
pub struct FullMirrorCache {
    current: ArcSwap<MirrorSnapshot>,
    lookup_key: KeyExtractor,
    hits: AtomicU64,
    misses: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
}

impl FullMirrorCache {
    /// Create an empty mirror indexing rows by `lookup_key`.
    #[must_use]
    pub fn new(lookup_key: KeyExtractor) -> Self {
        Self {
            current: ArcSwap::from_pointee(MirrorSnapshot::empty()),
            lookup_key,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            reload_failures: AtomicU64::new(0),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MirrorSnapshot> {
        self.current.load_full()
    }

    /// Whether at least one load has succeeded.
    #[must_use]
    pub fn has_loaded(&self) -> bool {
        self.current.load().version > 0
    }

    /// Index `rows` and publish them as the new snapshot.
    ///
    /// Rows with a NULL key are skipped. When two rows share a key the
    /// later one wins. Returns the new snapshot version.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Codec`] if a row is narrower than the key
    /// positions. The current snapshot is left unchanged.
    pub fn install(&self, rows: Vec<Row>) -> Result<u64, LookupError> {
        let mut index = FxHashMap::with_capacity_and_hasher(rows.len(), Default::default());
        let mut skipped = 0usize;
        for row in rows {
            match self.lookup_key.extract(&row)? {
                Some(key) => {
                    index.insert(key, row);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, "rows with NULL lookup key left out of mirror");
        }

        // Only reload tasks publish, and they run one at a time, so the
        // version read here is never raced.
        let version = self.current.load().version + 1;
        self.current.store(Arc::new(MirrorSnapshot {
            rows: index,
            version,
            loaded_at: Instant::now(),
        }));
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    /// Scan the remote store, decode every record, and publish the result.
    ///
    /// # Errors
    ///
    /// Returns the scan or decode error. The current snapshot stays in
    /// place and keeps serving reads.
    pub async fn reload<C, D>(&self, client: &C, codec: &D) -> Result<u64, LookupError>
    where
        C: RemoteLookupClient,
        D: RowCodec<C::Record>,
    {
        let result = async {
            let records = client.scan_all().await?;
            let rows = records
                .iter()
                .map(|record| codec.decode(record))
                .collect::<Result<Vec<_>, _>>()?;
            self.install(rows)
        }
        .await;

        if result.is_err() {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Snapshot of mirror counters.
    #[must_use]
    pub fn metrics(&self) -> MirrorMetrics {
        let snapshot = self.current.load();
        MirrorMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            entries: snapshot.len(),
            version: snapshot.version,
        }
    }
}

impl LookupTable for FullMirrorCache {
    fn get_cached(&self, key: &LookupKey) -> CacheResult {
        match self.current.load().get(key) {
            Some(row) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheResult::Hit(row.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheResult::Absent
            }
        }
    }

    fn maintain(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        self.current.load().len()
    }
}

impl std::fmt::Debug for FullMirrorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("FullMirrorCache")
            .field("version", &snapshot.version)
            .field("entries", &snapshot.len())
            .field("lookup_key", &self.lookup_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::row::ScalarValue;
    use crate::lookup::source::testing::{RowPassthrough, TestClient};

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![id.into(), name.into()])
    }

    fn key(id: i64) -> LookupKey {
        LookupKey::from(ScalarValue::Int64(id))
    }

    fn mirror() -> FullMirrorCache {
        FullMirrorCache::new(KeyExtractor::new(vec![0]))
    }

    #[test]
    fn test_empty_mirror_answers_absent() {
        let cache = mirror();
        assert!(!cache.has_loaded());
        assert!(cache.get_cached(&key(1)).is_absent());
        assert_eq!(cache.maintain(), 0);
    }

    #[test]
    fn test_install_indexes_rows() {
        let cache = mirror();
        let version = cache.install(vec![row(1, "a"), row(2, "b")]).unwrap();
        assert_eq!(version, 1);
        assert!(cache.has_loaded());
        assert_eq!(cache.get_cached(&key(2)), CacheResult::Hit(row(2, "b")));
        assert!(cache.get_cached(&key(3)).is_absent());

        let m = cache.metrics();
        assert_eq!((m.hits, m.misses, m.entries), (1, 1, 2));
    }

    #[test]
    fn test_duplicate_keys_last_wins_and_null_keys_skipped() {
        let cache = mirror();
        let null_row = Row::new(vec![ScalarValue::Null, "n".into()]);
        cache
            .install(vec![row(1, "first"), null_row, row(1, "second")])
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_cached(&key(1)), CacheResult::Hit(row(1, "second")));
    }

    #[test]
    fn test_old_snapshot_survives_swap() {
        let cache = mirror();
        cache.install(vec![row(1, "old")]).unwrap();
        let held = cache.snapshot();

        cache.install(vec![row(1, "new"), row(2, "b")]).unwrap();
        // A reader holding the old snapshot still sees it in full.
        assert_eq!(held.get(&key(1)), Some(&row(1, "old")));
        assert!(held.get(&key(2)).is_none());
        assert_eq!(held.version(), 1);

        assert_eq!(cache.snapshot().version(), 2);
        assert_eq!(cache.get_cached(&key(1)), CacheResult::Hit(row(1, "new")));
    }

    #[tokio::test]
    async fn test_reload_from_client() {
        let client = TestClient::new(vec![row(1, "a"), row(2, "b")]);
        let codec = RowPassthrough { arity: 2 };
        let cache = mirror();

        assert_eq!(cache.reload(&client, &codec).await.unwrap(), 1);
        assert_eq!(cache.len(), 2);

        client.rows.write().push(row(3, "c"));
        assert_eq!(cache.reload(&client, &codec).await.unwrap(), 2);
        assert!(cache.get_cached(&key(3)).is_hit());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_snapshot() {
        let client = TestClient::new(vec![row(1, "a")]);
        let codec = RowPassthrough { arity: 2 };
        let cache = mirror();
        cache.reload(&client, &codec).await.unwrap();

        client.rows.write().clear();
        client.fail_next_scan(LookupError::Transient("node down".into()));
        let err = cache.reload(&client, &codec).await.unwrap_err();
        assert!(err.is_transient());

        assert_eq!(cache.snapshot().version(), 1);
        assert!(cache.get_cached(&key(1)).is_hit());
        assert_eq!(cache.metrics().reload_failures, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_snapshot() {
        let client = TestClient::new(vec![row(1, "a")]);
        let cache = mirror();
        cache
            .reload(&client, &RowPassthrough { arity: 2 })
            .await
            .unwrap();

        let err = cache
            .reload(&client, &RowPassthrough { arity: 5 })
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::Codec(_)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let cache = Arc::new(mirror());
        cache
            .install((0..100).map(|i| row(i, "v1")).collect())
            .unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    let snapshot = cache.snapshot();
                    let tag = snapshot.get(&key(0)).cloned().unwrap();
                    for i in 0..100 {
                        assert_eq!(snapshot.get(&key(i)).unwrap().get(1), tag.get(1));
                    }
                }
            })
        };
        for v in 2..50 {
            let tag = format!("v{v}");
            cache
                .install((0..100).map(|i| row(i, &tag)).collect())
                .unwrap();
        }
        reader.join().unwrap();
    }
}
