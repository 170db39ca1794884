//! Error types for quarry operations

use thiserror::Error;

/// Record store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The backing store cannot be opened or created. Fatal to that store.
    #[error("Storage unavailable at {location}: {reason}")]
    Unavailable { location: String, reason: String },

    /// An existing structure is incompatible with this version. Fatal.
    #[error("Schema error: {reason}")]
    Schema { reason: String },

    /// A single operation failed. The caller may retry.
    #[error("Storage I/O failed during {operation}: {reason}")]
    Io { operation: String, reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn io(operation: &str, reason: impl ToString) -> Self {
        Self::Io {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Opaque failure reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// Status code reported by the remote endpoint, if any.
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Dispatch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Expected, non-fatal: the cache holds no result for the operation.
    #[error("Cache miss for operation {operation}")]
    CacheMiss { operation: String },

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation {operation} requires file upload but the transport has no upload capability")]
    NoUploadCapability { operation: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all quarry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuarryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl QuarryError {
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::Dispatch(DispatchError::CacheMiss { .. }))
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Dispatch(DispatchError::Transport(_)))
    }
}

impl From<TransportError> for QuarryError {
    fn from(e: TransportError) -> Self {
        Self::Dispatch(DispatchError::Transport(e))
    }
}

/// Result type alias for quarry operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================
