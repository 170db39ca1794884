//! LMDB-backed record store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep the record table in a
//! memory-mapped, transactional key-value environment.
//!
//! # Layout
//!
//! - Named database `records`: key column → JSON row `{"_id": u64, "record": text}`
//! - Named database `meta`: `schema_version` and the `next_id` counter,
//!   stored as big-endian `u64`
//!
//! # Thread Safety
//!
//! LMDB serializes write transactions and gives each read transaction a
//! consistent committed snapshot, so readers never observe a torn write.
//! The environment handle itself sits behind an `RwLock` so compaction can
//! close and reopen it exclusively.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{CompactionOption, Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use quarry_core::{CacheKey, QuarryResult, StorageError, StoredRow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{RecordStore, RECORDS_TABLE, SCHEMA_VERSION};

const META_TABLE: &str = "meta";
const META_SCHEMA_VERSION: &str = "schema_version";
const META_NEXT_ID: &str = "next_id";
const DATA_FILE: &str = "data.mdb";
const COMPACT_FILE: &str = "data.mdb.compact";

/// One persisted row of the records table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordRow {
    #[serde(rename = "_id")]
    id: u64,
    record: String,
}

struct Handles {
    env: Env,
    records: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
}

/// LMDB record store.
///
/// # Example
///
/// ```ignore
/// use quarry_storage::{LmdbRecordStore, RecordStore};
///
/// let store = LmdbRecordStore::open("/tmp/quarry", 64)?;
/// store.upsert(&"Hero:1".into(), r#"{"name":"Luke"}"#).await?;
/// ```
pub struct LmdbRecordStore {
    location: PathBuf,
    map_size_mb: usize,
    handles: RwLock<Option<Handles>>,
}

impl std::fmt::Debug for LmdbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbRecordStore")
            .field("location", &self.location)
            .field("map_size_mb", &self.map_size_mb)
            .finish()
    }
}

impl LmdbRecordStore {
    /// Open or create a store in the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if:
    /// - The directory cannot be created
    /// - The LMDB environment or its databases cannot be opened
    /// - The existing store was written with a different schema version
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> QuarryResult<Self> {
        let location = path.as_ref().to_path_buf();
        let handles = open_handles(&location, map_size_mb)?;

        check_schema(&handles).map_err(|e| match e {
            StorageError::Schema { reason } => StorageError::Unavailable {
                location: location.display().to_string(),
                reason,
            },
            other => other,
        })?;

        info!(location = %location.display(), map_size_mb, "Opened LMDB record store");

        Ok(Self {
            location,
            map_size_mb,
            handles: RwLock::new(Some(handles)),
        })
    }

    /// Directory holding the store files.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Row id of `key`, if stored.
    pub fn row_id(&self, key: &CacheKey) -> QuarryResult<Option<u64>> {
        self.with_handles(|h| {
            let rtxn = h.env.read_txn().map_err(|e| StorageError::io("read", e))?;
            let row = h
                .records
                .get(&rtxn, key.as_str())
                .map_err(|e| StorageError::io("read", e))?;
            Ok(row.and_then(decode_row).map(|row| row.id))
        })
    }

    fn with_handles<T>(
        &self,
        f: impl FnOnce(&Handles) -> Result<T, StorageError>,
    ) -> QuarryResult<T> {
        let guard = self.handles.read().map_err(|_| StorageError::LockPoisoned)?;
        let handles = guard.as_ref().ok_or_else(|| self.closed())?;
        f(handles).map_err(Into::into)
    }

    fn closed(&self) -> StorageError {
        StorageError::Unavailable {
            location: self.location.display().to_string(),
            reason: "environment closed after a failed compaction".to_string(),
        }
    }

    /// Copy the environment compacted, close it, swap the data file, reopen.
    fn compact(&self, slot: &mut Option<Handles>) -> Result<(), StorageError> {
        let handles = slot.take().ok_or_else(|| self.closed())?;
        let compacted = self.location.join(COMPACT_FILE);
        let data_file = self.location.join(DATA_FILE);

        if compacted.exists() {
            std::fs::remove_file(&compacted).map_err(|e| StorageError::io("compact", e))?;
        }

        let copied = handles
            .env
            .copy_to_file(&compacted, CompactionOption::Enabled)
            .map(drop)
            .map_err(|e| StorageError::io("compact", e));

        let Handles { env, .. } = handles;
        env.prepare_for_closing().wait();

        let swapped = copied.and_then(|()| {
            std::fs::rename(&compacted, &data_file).map_err(|e| StorageError::io("compact", e))
        });
        if swapped.is_err() {
            let _ = std::fs::remove_file(&compacted);
        }

        *slot = Some(open_handles(&self.location, self.map_size_mb)?);
        swapped
    }
}

fn open_handles(location: &Path, map_size_mb: usize) -> Result<Handles, StorageError> {
    let unavailable = |reason: String| StorageError::Unavailable {
        location: location.display().to_string(),
        reason,
    };

    let map_size = map_size_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| unavailable(format!("map size of {map_size_mb} MiB overflows")))?;

    std::fs::create_dir_all(location).map_err(|e| unavailable(e.to_string()))?;

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(2)
            .open(location)
    }
    .map_err(|e| unavailable(e.to_string()))?;

    let mut wtxn = env.write_txn().map_err(|e| unavailable(e.to_string()))?;
    let records: Database<Str, Bytes> = env
        .create_database(&mut wtxn, Some(RECORDS_TABLE))
        .map_err(|e| unavailable(e.to_string()))?;
    let meta: Database<Str, Bytes> = env
        .create_database(&mut wtxn, Some(META_TABLE))
        .map_err(|e| unavailable(e.to_string()))?;
    wtxn.commit().map_err(|e| unavailable(e.to_string()))?;

    Ok(Handles { env, records, meta })
}

fn check_schema(handles: &Handles) -> Result<(), StorageError> {
    let mut wtxn = handles
        .env
        .write_txn()
        .map_err(|e| StorageError::io("ensure_schema", e))?;

    match read_counter(&handles.meta, &wtxn, META_SCHEMA_VERSION)? {
        Some(SCHEMA_VERSION) => {}
        Some(found) => {
            return Err(StorageError::Schema {
                reason: format!("store has schema version {found}, expected {SCHEMA_VERSION}"),
            });
        }
        None => {
            let existing = handles
                .records
                .len(&wtxn)
                .map_err(|e| StorageError::io("ensure_schema", e))?;
            if existing > 0 {
                return Err(StorageError::Schema {
                    reason: format!("{existing} rows present without a schema version"),
                });
            }
            write_counter(&handles.meta, &mut wtxn, META_SCHEMA_VERSION, SCHEMA_VERSION)?;
            write_counter(&handles.meta, &mut wtxn, META_NEXT_ID, 1)?;
            info!(version = SCHEMA_VERSION, "Created record store schema");
        }
    }

    wtxn.commit().map_err(|e| StorageError::io("ensure_schema", e))
}

fn read_counter(
    meta: &Database<Str, Bytes>,
    txn: &RoTxn,
    name: &str,
) -> Result<Option<u64>, StorageError> {
    let Some(bytes) = meta.get(txn, name).map_err(|e| StorageError::io("read meta", e))? else {
        return Ok(None);
    };
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StorageError::Schema {
        reason: format!("meta entry {name} is not a u64"),
    })?;
    Ok(Some(u64::from_be_bytes(raw)))
}

fn write_counter(
    meta: &Database<Str, Bytes>,
    txn: &mut RwTxn,
    name: &str,
    value: u64,
) -> Result<(), StorageError> {
    meta.put(txn, name, &value.to_be_bytes())
        .map_err(|e| StorageError::io("write meta", e))
}

fn decode_row(bytes: &[u8]) -> Option<RecordRow> {
    serde_json::from_slice(bytes).ok()
}

fn write_rows<'a>(
    handles: &Handles,
    rows: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<usize, StorageError> {
    let mut wtxn = handles
        .env
        .write_txn()
        .map_err(|e| StorageError::io("upsert", e))?;
    let mut next_id = read_counter(&handles.meta, &wtxn, META_NEXT_ID)?.unwrap_or(1);
    let mut written = 0;

    for (key, record) in rows {
        let existing = handles
            .records
            .get(&wtxn, key)
            .map_err(|e| StorageError::io("upsert", e))?
            .and_then(decode_row)
            .map(|row| row.id);
        let id = match existing {
            Some(id) => id,
            None => {
                next_id += 1;
                next_id - 1
            }
        };

        let bytes = serde_json::to_vec(&RecordRow {
            id,
            record: record.to_string(),
        })
        .map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        handles
            .records
            .put(&mut wtxn, key, &bytes)
            .map_err(|e| StorageError::io("upsert", e))?;
        written += 1;
    }

    write_counter(&handles.meta, &mut wtxn, META_NEXT_ID, next_id)?;
    wtxn.commit().map_err(|e| StorageError::io("upsert", e))?;
    Ok(written)
}

#[async_trait]
impl RecordStore for LmdbRecordStore {
    async fn ensure_schema(&self) -> QuarryResult<()> {
        self.with_handles(check_schema)
    }

    async fn batch_get(&self, keys: &HashSet<CacheKey>) -> QuarryResult<Vec<StoredRow>> {
        self.with_handles(|h| {
            let rtxn = h.env.read_txn().map_err(|e| StorageError::io("batch_get", e))?;
            let mut rows = Vec::with_capacity(keys.len());

            for key in keys {
                let Some(bytes) = h
                    .records
                    .get(&rtxn, key.as_str())
                    .map_err(|e| StorageError::io("batch_get", e))?
                else {
                    continue;
                };
                match decode_row(bytes) {
                    Some(row) => rows.push(StoredRow::new(key.clone(), row.record)),
                    None => warn!(key = %key, "Skipping undecodable row"),
                }
            }

            Ok(rows)
        })
    }

    async fn upsert(&self, key: &CacheKey, record: &str) -> QuarryResult<()> {
        self.with_handles(|h| write_rows(h, [(key.as_str(), record)]).map(drop))
    }

    async fn upsert_batch(&self, rows: Vec<StoredRow>) -> QuarryResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_handles(|h| {
            let written = write_rows(
                h,
                rows.iter().map(|row| (row.key.as_str(), row.record.as_str())),
            )?;
            debug!(rows = written, "Upserted record batch");
            Ok(())
        })
    }

    async fn delete(&self, key: &CacheKey) -> QuarryResult<()> {
        self.with_handles(|h| {
            let mut wtxn = h.env.write_txn().map_err(|e| StorageError::io("delete", e))?;
            h.records
                .delete(&mut wtxn, key.as_str())
                .map_err(|e| StorageError::io("delete", e))?;
            wtxn.commit().map_err(|e| StorageError::io("delete", e))
        })
    }

    async fn clear(&self, compact: bool) -> QuarryResult<()> {
        let mut guard = self.handles.write().map_err(|_| StorageError::LockPoisoned)?;

        {
            let handles = guard.as_ref().ok_or_else(|| self.closed())?;
            let mut wtxn = handles
                .env
                .write_txn()
                .map_err(|e| StorageError::io("clear", e))?;
            handles
                .records
                .clear(&mut wtxn)
                .map_err(|e| StorageError::io("clear", e))?;
            wtxn.commit().map_err(|e| StorageError::io("clear", e))?;
        }

        if compact {
            self.compact(&mut guard)?;
        }

        info!(location = %self.location.display(), compact, "Cleared record store");
        Ok(())
    }

    async fn row_count(&self) -> QuarryResult<u64> {
        self.with_handles(|h| {
            let rtxn = h.env.read_txn().map_err(|e| StorageError::io("row_count", e))?;
            h.records
                .len(&rtxn)
                .map_err(|e| StorageError::io("row_count", e))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
