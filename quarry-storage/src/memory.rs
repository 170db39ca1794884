//! In-memory record store for ephemeral caches and tests.

use async_trait::async_trait;
use quarry_core::{CacheKey, QuarryResult, StoredRow};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::store::RecordStore;

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<CacheKey, (u64, String)>,
    next_id: u64,
}

/// Record store held entirely in memory.
///
/// Writers take the table lock exclusively, so readers only ever see
/// complete upserts.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    table: RwLock<Table>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row id of `key`, if stored.
    pub async fn row_id(&self, key: &CacheKey) -> Option<u64> {
        self.table.read().await.rows.get(key).map(|(id, _)| *id)
    }
}

impl Table {
    fn put(&mut self, key: CacheKey, record: String) {
        match self.rows.get_mut(&key) {
            Some(row) => row.1 = record,
            None => {
                self.next_id += 1;
                self.rows.insert(key, (self.next_id, record));
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ensure_schema(&self) -> QuarryResult<()> {
        Ok(())
    }

    async fn batch_get(&self, keys: &HashSet<CacheKey>) -> QuarryResult<Vec<StoredRow>> {
        let table = self.table.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| {
                table
                    .rows
                    .get(key)
                    .map(|(_, record)| StoredRow::new(key.clone(), record.clone()))
            })
            .collect())
    }

    async fn upsert(&self, key: &CacheKey, record: &str) -> QuarryResult<()> {
        self.table
            .write()
            .await
            .put(key.clone(), record.to_string());
        Ok(())
    }

    async fn upsert_batch(&self, rows: Vec<StoredRow>) -> QuarryResult<()> {
        let mut table = self.table.write().await;
        for row in rows {
            table.put(row.key, row.record);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<()> {
        self.table.write().await.rows.remove(key);
        Ok(())
    }

    async fn clear(&self, compact: bool) -> QuarryResult<()> {
        let mut table = self.table.write().await;
        table.rows.clear();
        if compact {
            table.rows.shrink_to_fit();
        }
        Ok(())
    }

    async fn row_count(&self) -> QuarryResult<u64> {
        Ok(self.table.read().await.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quarry_test_utils::generators::{arb_cache_key, arb_record};

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryRecordStore::new();
        let key = CacheKey::from("Hero:1");

        store.upsert(&key, "1").await.expect("upsert should succeed");
        store.upsert(&key, "2").await.expect("upsert should succeed");
        assert_eq!(store.row_id(&key).await, Some(1));

        let wanted: HashSet<CacheKey> = [key.clone(), CacheKey::from("Hero:2")].into_iter().collect();
        let rows = store.batch_get(&wanted).await.expect("batch_get should succeed");
        assert_eq!(rows, vec![StoredRow::new("Hero:1", "2")]);

        store
            .delete(&CacheKey::from("Hero:404"))
            .await
            .expect("delete of missing key should succeed");
        assert_eq!(store.row_count().await.expect("count should succeed"), 1);

        store.clear(true).await.expect("clear should succeed");
        assert!(store
            .batch_get(&wanted)
            .await
            .expect("batch_get should succeed")
            .is_empty());

        store.upsert(&key, "3").await.expect("upsert after clear should succeed");
        assert_eq!(store.row_id(&key).await, Some(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Upserting a record and reading its key returns exactly that row.
        #[test]
        fn prop_upsert_then_get_returns_row(key in arb_cache_key(), record in arb_record()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = MemoryRecordStore::new();
                let text = record.to_string();
                store.upsert(&key, &text).await.unwrap();

                let wanted: HashSet<CacheKey> = [key.clone()].into_iter().collect();
                let rows = store.batch_get(&wanted).await.unwrap();
                prop_assert_eq!(rows, vec![StoredRow::new(key, text)]);
                Ok(())
            })?;
        }
    }
}
