//! Quarry Core - Data Model and Contracts
//!
//! Types shared by every quarry crate: cache keys and records, cache
//! policies, the operation token, the transport and normalization contracts,
//! error types, and configuration. This crate holds no storage or dispatch
//! logic of its own.

pub mod config;
pub mod error;
pub mod key;
pub mod normalize;
pub mod operation;
pub mod policy;
pub mod response;
pub mod transport;

pub use config::{QuarryConfig, StoreConfig};
pub use error::{
    ConfigError, DispatchError, QuarryError, QuarryResult, StorageError, TransportError,
};
pub use key::{CacheKey, Record, RecordSet, StoredRow};
pub use normalize::{Normalizer, Resolution};
pub use operation::{operation_fingerprint, Operation, OperationKind, OperationRequest, UploadFile};
pub use policy::CachePolicy;
pub use response::{DispatchResult, GraphError, GraphResponse, OperationResult, ResultSource};
pub use transport::{RequestContext, Transport, TransportRequest, UploadTransport};
