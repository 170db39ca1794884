//! Quarry Storage - Record Store and Normalized Cache
//!
//! Durable keyed record storage (LMDB and in-memory), the normalized cache
//! layered over it, and the change feed watchers subscribe to.

pub mod changes;
pub mod lmdb;
pub mod memory;
pub mod normalized;
pub mod store;

pub use changes::{ChangeFeed, ChangeSet, ChangeSubscription};
pub use lmdb::LmdbRecordStore;
pub use memory::MemoryRecordStore;
pub use normalized::{
    merge_record, CacheStats, CachedResult, NormalizedCache, DEFAULT_MAX_RESOLUTION_ROUNDS,
};
pub use store::{
    RecordStore, COLUMN_ID, COLUMN_KEY, COLUMN_RECORD, RECORDS_TABLE, SCHEMA_VERSION,
};
