//! Cache keys and records.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier of one normalized record.
///
/// Keys are produced by the normalization step and never generated here.
/// Equality and hashing are structural over the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Parsed record payload. Records are JSON documents; objects carry fields.
pub type Record = serde_json::Value;

/// A batch of records keyed by cache key.
pub type RecordSet = HashMap<CacheKey, Record>;

/// One row read back from durable storage: the key and its serialized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub key: CacheKey,
    pub record: String,
}

impl StoredRow {
    pub fn new(key: impl Into<CacheKey>, record: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            record: record.into(),
        }
    }
}
