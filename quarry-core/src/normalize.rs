//! Normalization contract.
//!
//! Normalization decomposes an operation's result into individual records
//! keyed by cache key, and resolves an operation back out of records. The
//! algorithm itself lives outside quarry; this module only fixes the seam.

use serde_json::Value;
use std::collections::HashSet;

use crate::key::{CacheKey, RecordSet};
use crate::operation::Operation;

/// Outcome of resolving an operation against the records loaded so far.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The operation's data was fully resolved.
    Resolved {
        data: Value,
        dependent_keys: HashSet<CacheKey>,
    },

    /// More records are needed before the operation can resolve.
    Incomplete { missing: HashSet<CacheKey> },

    /// The records cannot satisfy the operation.
    Miss,
}

/// Decomposes results into records and reassembles them.
///
/// # Implementation Requirements
///
/// - `normalize` must be deterministic for a given operation and payload
/// - `resolve` must only request keys it does not already have; returning
///   `Incomplete` with keys already present in `records` is treated as a miss
pub trait Normalizer: Send + Sync {
    /// Keys the cache must load first to resolve `operation`.
    fn entry_keys(&self, operation: &dyn Operation) -> HashSet<CacheKey>;

    /// Split a resolved result payload into records.
    fn normalize(&self, operation: &dyn Operation, data: &Value) -> RecordSet;

    /// Try to rebuild the operation's data from `records`.
    fn resolve(&self, operation: &dyn Operation, records: &RecordSet) -> Resolution;
}
