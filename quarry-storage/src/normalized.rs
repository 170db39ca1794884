//! Normalized cache: JSON record semantics and change tracking over a
//! [`RecordStore`].
//!
//! Reads parse stored payloads; a payload that fails to parse is dropped and
//! reported as not cached. Merges run their read-compare-upsert sequence under
//! one write lock, commit the batch atomically, and publish the changed keys
//! before releasing the lock so change sets reach subscribers in write order.

use quarry_core::{
    CacheKey, Normalizer, Operation, QuarryResult, Record, RecordSet, Resolution, StorageError,
    StoredRow,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::changes::{ChangeFeed, ChangeSubscription};
use crate::store::RecordStore;

/// Default bound on load/resolve rounds for one operation.
pub const DEFAULT_MAX_RESOLUTION_ROUNDS: usize = 16;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Operations resolved from the cache.
    pub hits: u64,
    /// Operations the cache could not resolve.
    pub misses: u64,
    /// Stored payloads dropped because they failed to parse.
    pub malformed: u64,
    /// Merges that committed at least one change.
    pub merges: u64,
    /// Total keys reported changed across all merges.
    pub changed_keys: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    malformed: AtomicU64,
    merges: AtomicU64,
    changed_keys: AtomicU64,
}

/// An operation's data rebuilt from cached records.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub data: Value,
    pub dependent_keys: HashSet<CacheKey>,
}

/// Record store wrapper with JSON semantics and a change feed.
pub struct NormalizedCache {
    store: Arc<dyn RecordStore>,
    normalizer: Arc<dyn Normalizer>,
    feed: ChangeFeed,
    write_lock: Mutex<()>,
    stats: StatsCounters,
    max_resolution_rounds: usize,
}

impl std::fmt::Debug for NormalizedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizedCache")
            .field("feed", &self.feed)
            .field("stats", &self.stats)
            .field("max_resolution_rounds", &self.max_resolution_rounds)
            .finish()
    }
}

/// Overlay `incoming` onto `stored`.
///
/// Objects merge field by field, keeping stored fields the incoming record
/// does not mention. Anything else is replaced.
pub fn merge_record(stored: &Record, incoming: &Record) -> Record {
    match (stored, incoming) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut merged = base.clone();
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

impl NormalizedCache {
    pub fn new(store: Arc<dyn RecordStore>, normalizer: Arc<dyn Normalizer>) -> Self {
        Self {
            store,
            normalizer,
            feed: ChangeFeed::new(),
            write_lock: Mutex::new(()),
            stats: StatsCounters::default(),
            max_resolution_rounds: DEFAULT_MAX_RESOLUTION_ROUNDS,
        }
    }

    /// Set the load/resolve round bound. Zero is treated as one.
    pub fn with_max_resolution_rounds(mut self, rounds: usize) -> Self {
        self.max_resolution_rounds = rounds.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Arc<dyn Normalizer> {
        &self.normalizer
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Register for change sets published by later writes.
    pub fn subscribe(&self) -> ChangeSubscription {
        self.feed.subscribe()
    }

    /// Read and parse the records stored for `keys`.
    ///
    /// Keys with no row and keys whose payload fails to parse are both absent
    /// from the result.
    pub async fn read(&self, keys: &HashSet<CacheKey>) -> QuarryResult<RecordSet> {
        if keys.is_empty() {
            return Ok(RecordSet::new());
        }

        let rows = self.store.batch_get(keys).await?;
        let mut records = RecordSet::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str::<Record>(&row.record) {
                Ok(record) => {
                    records.insert(row.key, record);
                }
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %row.key, error = %e, "Dropping malformed cached record");
                }
            }
        }
        Ok(records)
    }

    /// Merge `records` into the store and return the keys whose value changed.
    pub async fn merge(&self, records: RecordSet) -> QuarryResult<HashSet<CacheKey>> {
        self.merge_from(records, None).await
    }

    /// Merge `records`, tagging the published change set with `origin`.
    pub async fn merge_from(
        &self,
        records: RecordSet,
        origin: Option<Uuid>,
    ) -> QuarryResult<HashSet<CacheKey>> {
        if records.is_empty() {
            return Ok(HashSet::new());
        }

        let _guard = self.write_lock.lock().await;

        let keys: HashSet<CacheKey> = records.keys().cloned().collect();
        let existing = self.read(&keys).await?;

        let mut changed = HashSet::new();
        let mut rows = Vec::new();
        for (key, incoming) in records {
            let stored = existing.get(&key);
            let merged = match stored {
                Some(stored) => merge_record(stored, &incoming),
                None => incoming,
            };
            if stored == Some(&merged) {
                continue;
            }

            let text = serde_json::to_string(&merged).map_err(|e| StorageError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            rows.push(StoredRow::new(key.clone(), text));
            changed.insert(key);
        }

        if changed.is_empty() {
            return Ok(changed);
        }

        self.store.upsert_batch(rows).await?;
        self.stats.merges.fetch_add(1, Ordering::Relaxed);
        self.stats
            .changed_keys
            .fetch_add(changed.len() as u64, Ordering::Relaxed);
        debug!(changed = changed.len(), origin = ?origin, "Merged records");

        self.feed.publish(changed.clone(), origin);
        Ok(changed)
    }

    /// Delete the record for `key`, publishing the key if a row was removed.
    pub async fn remove_record(&self, key: &CacheKey) -> QuarryResult<()> {
        let _guard = self.write_lock.lock().await;

        let wanted: HashSet<CacheKey> = [key.clone()].into_iter().collect();
        let existed = !self.store.batch_get(&wanted).await?.is_empty();
        self.store.delete(key).await?;

        if existed {
            self.feed.publish(wanted, None);
        }
        Ok(())
    }

    /// Remove every record. Publishes nothing.
    pub async fn clear(&self, compact: bool) -> QuarryResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.clear(compact).await
    }

    /// Split an operation result into records.
    pub fn normalize(&self, operation: &dyn Operation, data: &Value) -> RecordSet {
        self.normalizer.normalize(operation, data)
    }

    /// Rebuild `operation`'s data from cached records.
    ///
    /// Loads the normalizer's entry keys, then keeps loading whatever it
    /// reports missing, up to the configured round bound. A key requested
    /// twice, a plain miss, or running out of rounds all count as a miss.
    pub async fn load(&self, operation: &dyn Operation) -> QuarryResult<Option<CachedResult>> {
        let mut records = RecordSet::new();
        let mut requested = self.normalizer.entry_keys(operation);
        let mut to_load = requested.clone();

        for round in 0..self.max_resolution_rounds {
            records.extend(self.read(&to_load).await?);

            match self.normalizer.resolve(operation, &records) {
                Resolution::Resolved {
                    data,
                    dependent_keys,
                } => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(operation = operation.name(), rounds = round + 1, "Cache hit");
                    return Ok(Some(CachedResult {
                        data,
                        dependent_keys,
                    }));
                }
                Resolution::Miss => break,
                Resolution::Incomplete { missing } => {
                    to_load = missing
                        .into_iter()
                        .filter(|key| !requested.contains(key))
                        .collect();
                    if to_load.is_empty() {
                        break;
                    }
                    requested.extend(to_load.iter().cloned());
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(operation = operation.name(), "Cache miss");
        Ok(None)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            merges: self.stats.merges.load(Ordering::Relaxed),
            changed_keys: self.stats.changed_keys.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use crate::LmdbRecordStore;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use quarry_core::QuarryError;
    use quarry_test_utils::generators::arb_record_set;
    use quarry_test_utils::{fixtures, RootFieldNormalizer, QUERY_ROOT};
    use serde_json::json;

    fn memory_cache() -> (NormalizedCache, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = NormalizedCache::new(store.clone(), Arc::new(RootFieldNormalizer::new()));
        (cache, store)
    }

    fn single(key: &str, record: Value) -> RecordSet {
        [(CacheKey::from(key), record)].into_iter().collect()
    }

    /// Store whose every call fails with an I/O error.
    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn ensure_schema(&self) -> QuarryResult<()> {
            Ok(())
        }
        async fn batch_get(&self, _keys: &HashSet<CacheKey>) -> QuarryResult<Vec<StoredRow>> {
            Err(StorageError::io("batch_get", "disk gone").into())
        }
        async fn upsert(&self, _key: &CacheKey, _record: &str) -> QuarryResult<()> {
            Err(StorageError::io("upsert", "disk gone").into())
        }
        async fn upsert_batch(&self, _rows: Vec<StoredRow>) -> QuarryResult<()> {
            Err(StorageError::io("upsert", "disk gone").into())
        }
        async fn delete(&self, _key: &CacheKey) -> QuarryResult<()> {
            Err(StorageError::io("delete", "disk gone").into())
        }
        async fn clear(&self, _compact: bool) -> QuarryResult<()> {
            Err(StorageError::io("clear", "disk gone").into())
        }
        async fn row_count(&self) -> QuarryResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_merge_reports_only_changed_keys() {
        let (cache, _store) = memory_cache();
        let record = json!({"id": "Hero:1", "name": "Luke"});

        let changed = cache
            .merge(single("Hero:1", record.clone()))
            .await
            .expect("merge should succeed");
        assert_eq!(changed.len(), 1);

        let changed = cache
            .merge(single("Hero:1", record))
            .await
            .expect("merge should succeed");
        assert!(changed.is_empty());

        let changed = cache
            .merge(single("Hero:1", json!({"id": "Hero:1", "name": "Leia"})))
            .await
            .expect("merge should succeed");
        assert_eq!(changed, [CacheKey::from("Hero:1")].into_iter().collect());

        let stats = cache.stats();
        assert_eq!(stats.merges, 2);
        assert_eq!(stats.changed_keys, 2);
    }

    #[tokio::test]
    async fn test_merge_overlays_object_fields() {
        let (cache, _store) = memory_cache();
        cache
            .merge(single("Hero:1", json!({"name": "Luke", "height": 172})))
            .await
            .expect("merge should succeed");
        cache
            .merge(single("Hero:1", json!({"name": "Skywalker"})))
            .await
            .expect("merge should succeed");

        let records = cache
            .read(&[CacheKey::from("Hero:1")].into_iter().collect())
            .await
            .expect("read should succeed");
        assert_eq!(
            records.get("Hero:1"),
            Some(&json!({"name": "Skywalker", "height": 172}))
        );

        // A subset of stored fields with equal values is not a change.
        let changed = cache
            .merge(single("Hero:1", json!({"height": 172})))
            .await
            .expect("merge should succeed");
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_read_drops_malformed_payloads() {
        let (cache, store) = memory_cache();
        store
            .upsert(&CacheKey::from("Hero:1"), "{not json")
            .await
            .expect("upsert should succeed");
        store
            .upsert(&CacheKey::from("Hero:2"), r#"{"name":"Han"}"#)
            .await
            .expect("upsert should succeed");

        let wanted: HashSet<CacheKey> = ["Hero:1", "Hero:2", "Hero:3"]
            .into_iter()
            .map(CacheKey::from)
            .collect();
        let records = cache.read(&wanted).await.expect("read should succeed");

        assert_eq!(records.len(), 1);
        assert!(records.contains_key("Hero:2"));
        assert_eq!(cache.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_merge_publishes_with_origin() {
        let (cache, _store) = memory_cache();
        let mut sub = cache.subscribe();
        let origin = Uuid::now_v7();

        cache
            .merge_from(single("Hero:1", json!({"name": "Luke"})), Some(origin))
            .await
            .expect("merge should succeed");
        cache
            .merge(single("Hero:1", json!({"name": "Luke"})))
            .await
            .expect("merge should succeed");

        let change = sub.try_recv().expect("change should be published");
        assert!(change.is_from(origin));
        assert!(sub.try_recv().is_none(), "unchanged merge publishes nothing");
    }

    #[tokio::test]
    async fn test_remove_record_publishes_only_when_present() {
        let (cache, _store) = memory_cache();
        cache
            .merge(single("Hero:1", json!({"name": "Luke"})))
            .await
            .expect("merge should succeed");
        let mut sub = cache.subscribe();

        cache
            .remove_record(&CacheKey::from("Hero:404"))
            .await
            .expect("remove of missing key should succeed");
        assert!(sub.try_recv().is_none());

        cache
            .remove_record(&CacheKey::from("Hero:1"))
            .await
            .expect("remove should succeed");
        let change = sub.try_recv().expect("removal should be published");
        assert!(change.keys.contains("Hero:1"));

        cache.clear(false).await.expect("clear should succeed");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_load_resolves_normalized_result() {
        let (cache, _store) = memory_cache();
        let op = fixtures::hero_query();

        assert_eq!(cache.load(op.as_ref()).await.expect("load should succeed"), None);

        let records = cache.normalize(op.as_ref(), &fixtures::hero_payload("Luke"));
        cache.merge(records).await.expect("merge should succeed");

        let cached = cache
            .load(op.as_ref())
            .await
            .expect("load should succeed")
            .expect("operation should resolve");
        assert_eq!(cached.data, fixtures::hero_payload("Luke"));
        assert_eq!(
            cached.dependent_keys,
            [QUERY_ROOT, "Hero:1"].into_iter().map(CacheKey::from).collect()
        );

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_load_misses_when_entity_missing() {
        let (cache, _store) = memory_cache();
        let op = fixtures::hero_query();
        cache
            .merge(single(QUERY_ROOT, json!({"hero": {"__ref": "Hero:1"}})))
            .await
            .expect("merge should succeed");

        assert_eq!(cache.load(op.as_ref()).await.expect("load should succeed"), None);
    }

    #[tokio::test]
    async fn test_load_respects_round_bound() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = NormalizedCache::new(store, Arc::new(RootFieldNormalizer::new()))
            .with_max_resolution_rounds(1);
        let op = fixtures::hero_query();
        let records = cache.normalize(op.as_ref(), &fixtures::hero_payload("Luke"));
        cache.merge(records).await.expect("merge should succeed");

        // Root plus entity needs two rounds.
        assert_eq!(cache.load(op.as_ref()).await.expect("load should succeed"), None);
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let cache = NormalizedCache::new(Arc::new(FailingStore), Arc::new(RootFieldNormalizer::new()));
        let err = cache.load(fixtures::hero_query().as_ref()).await.unwrap_err();
        assert!(matches!(err, QuarryError::Storage(StorageError::Io { .. })));

        let err = cache
            .merge(single("Hero:1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryError::Storage(StorageError::Io { .. })));
    }

    #[tokio::test]
    async fn test_merge_over_lmdb_store() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let store = LmdbRecordStore::open(temp_dir.path(), 10).expect("open should succeed");
        let cache = NormalizedCache::new(Arc::new(store), Arc::new(RootFieldNormalizer::new()));
        let op = fixtures::hero_query();

        let records = cache.normalize(op.as_ref(), &fixtures::hero_payload("Luke"));
        let changed = cache.merge(records).await.expect("merge should succeed");
        assert_eq!(changed.len(), 2);
        assert_eq!(cache.store().row_count().await.expect("count should succeed"), 2);
        assert!(cache
            .load(op.as_ref())
            .await
            .expect("load should succeed")
            .is_some());
    }

    #[test]
    fn test_merge_record_replaces_non_objects() {
        assert_eq!(merge_record(&json!([1, 2]), &json!([3])), json!([3]));
        assert_eq!(merge_record(&json!({"a": 1}), &json!("text")), json!("text"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Merging the same record set twice reports no changes the second time.
        #[test]
        fn prop_repeated_merge_reports_nothing(records in arb_record_set()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (cache, _store) = memory_cache();
                let first = cache.merge(records.clone()).await.unwrap();
                prop_assert_eq!(first.len(), records.len());

                let second = cache.merge(records).await.unwrap();
                prop_assert!(second.is_empty());
                Ok(())
            })?;
        }
    }
}
