//! Operation results delivered by transports and dispatches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::QuarryResult;
use crate::key::CacheKey;

/// An error entry returned by the remote endpoint alongside (or instead of) data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

/// Terminal success from a transport: data and errors may both be present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphError>,
}

impl GraphResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: GraphError) -> Self {
        self.errors.push(error);
        self
    }
}

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Server,
}

/// One result delivered by a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub data: Option<Value>,
    pub errors: Vec<GraphError>,
    pub source: ResultSource,
    /// Cache keys backing this result. Watchers use this as their dependency set.
    pub dependent_keys: HashSet<CacheKey>,
}

impl OperationResult {
    pub fn from_cache(data: Value, dependent_keys: HashSet<CacheKey>) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
            source: ResultSource::Cache,
            dependent_keys,
        }
    }

    pub fn from_server(response: GraphResponse, dependent_keys: HashSet<CacheKey>) -> Self {
        Self {
            data: response.data,
            errors: response.errors,
            source: ResultSource::Server,
            dependent_keys,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResultSource::Cache
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// What a dispatch delivers to its subscribers, once per emission.
pub type DispatchResult = QuarryResult<OperationResult>;
