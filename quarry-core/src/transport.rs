//! Transport contract.
//!
//! A transport sends one operation to a remote endpoint and yields exactly
//! one terminal result. Network I/O, serialization, and retry policy all
//! belong to the transport.
//!
//! # Cancellation
//!
//! The dispatcher abandons delivery by dropping the future returned from
//! [`Transport::send`]. Implementations that cannot interrupt their I/O may
//! let it run to completion in the background; the result is discarded.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::operation::{Operation, UploadFile};
use crate::policy::CachePolicy;
use crate::response::GraphResponse;

/// Per-request context forwarded to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub headers: BTreeMap<String, String>,
    /// Advisory timeout. The transport decides how to honour it.
    pub timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One request handed to a transport.
#[derive(Clone)]
pub struct TransportRequest {
    pub operation: Arc<dyn Operation>,
    pub policy: CachePolicy,
    pub context: RequestContext,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("operation", &self.operation.name())
            .field("policy", &self.policy)
            .field("context", &self.context)
            .finish()
    }
}

/// Sends operations to a remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one operation and return its terminal result.
    async fn send(&self, request: TransportRequest) -> Result<GraphResponse, TransportError>;

    /// Upload support, if this transport has it.
    ///
    /// Transports without multipart support keep the default `None`; the
    /// dispatcher then fails upload operations with `NoUploadCapability`.
    fn upload_capability(&self) -> Option<&dyn UploadTransport> {
        None
    }
}

/// Specialized handle for transports that can send files with an operation.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(
        &self,
        request: TransportRequest,
        files: Vec<UploadFile>,
    ) -> Result<GraphResponse, TransportError>;
}
