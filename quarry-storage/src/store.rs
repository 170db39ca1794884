//! Record store contract.
//!
//! A record store is a durable table mapping a cache key to one serialized
//! record. Implementations must give readers only committed state and
//! serialize writers.

use async_trait::async_trait;
use quarry_core::{CacheKey, QuarryResult, StoredRow};
use std::collections::HashSet;

/// Name of the durable table.
pub const RECORDS_TABLE: &str = "records";
/// Auto-incrementing row id column.
pub const COLUMN_ID: &str = "_id";
/// Unique, indexed key column.
pub const COLUMN_KEY: &str = "key";
/// JSON-serialized record column.
pub const COLUMN_RECORD: &str = "record";
/// Layout version written by [`RecordStore::ensure_schema`].
pub const SCHEMA_VERSION: u64 = 1;

/// Durable keyed record storage.
///
/// # Implementation Requirements
///
/// - `batch_get` returns at most one row per requested key, in any order, and
///   omits keys with no row. It either succeeds wholly or fails.
/// - `upsert` and `upsert_batch` replace existing rows in place, keeping
///   their row id.
/// - `delete` on an absent key is a no-op.
/// - `clear` leaves the store either fully cleared or unchanged.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the table if absent. Idempotent.
    async fn ensure_schema(&self) -> QuarryResult<()>;

    async fn batch_get(&self, keys: &HashSet<CacheKey>) -> QuarryResult<Vec<StoredRow>>;

    async fn upsert(&self, key: &CacheKey, record: &str) -> QuarryResult<()>;

    /// Upsert many rows in one write. All rows commit or none do.
    async fn upsert_batch(&self, rows: Vec<StoredRow>) -> QuarryResult<()>;

    async fn delete(&self, key: &CacheKey) -> QuarryResult<()>;

    /// Remove every row. With `compact`, also reclaim storage space.
    ///
    /// Compaction blocks; callers must quiesce other reads and writes first.
    async fn clear(&self, compact: bool) -> QuarryResult<()>;

    async fn row_count(&self) -> QuarryResult<u64>;
}
