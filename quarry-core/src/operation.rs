//! Operation tokens.
//!
//! An operation (query, mutation, or subscription) is identified by its
//! shape and variables. This crate treats it as an opaque token handed to
//! the transport and the normalizer; it never interprets the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// A file attached to an operation for multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Variable path the file binds to, e.g. `variables.avatar`.
    pub field_name: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// An operation the dispatcher can run.
///
/// Implementations must be cheap to share; the dispatcher holds them behind
/// `Arc<dyn Operation>` for the lifetime of a dispatch or watcher.
pub trait Operation: Send + Sync + fmt::Debug {
    fn kind(&self) -> OperationKind;

    /// Operation name used in logs and errors.
    fn name(&self) -> &str;

    /// Operation document, opaque to this crate.
    fn document(&self) -> &str;

    fn variables(&self) -> &Value;

    /// Files that must be sent with the operation. Non-empty means the
    /// dispatch requires an upload-capable transport.
    fn uploads(&self) -> &[UploadFile] {
        &[]
    }

    /// Structural identity of the operation: SHA-256 over name, document,
    /// and variables.
    fn fingerprint(&self) -> String {
        operation_fingerprint(self.name(), self.document(), self.variables())
    }
}

/// Compute the hex SHA-256 fingerprint of an operation's shape and variables.
///
/// `serde_json` keeps object keys sorted (no `preserve_order`), so the
/// serialized variables are canonical.
pub fn operation_fingerprint(name: &str, document: &str, variables: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(document.as_bytes());
    hasher.update([0u8]);
    hasher.update(variables.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Plain operation value usable with any transport and normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    kind: OperationKind,
    name: String,
    document: String,
    variables: Value,
    uploads: Vec<UploadFile>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, name: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            document: document.into(),
            variables: Value::Null,
            uploads: Vec::new(),
        }
    }

    pub fn query(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self::new(OperationKind::Query, name, document)
    }

    pub fn mutation(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self::new(OperationKind::Mutation, name, document)
    }

    pub fn subscription(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self::new(OperationKind::Subscription, name, document)
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_upload(mut self, file: UploadFile) -> Self {
        self.uploads.push(file);
        self
    }
}

impl Operation for OperationRequest {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn document(&self) -> &str {
        &self.document
    }

    fn variables(&self) -> &Value {
        &self.variables
    }

    fn uploads(&self) -> &[UploadFile] {
        &self.uploads
    }
}
