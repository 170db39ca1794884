//! Cooperative cancellation and gated result delivery.
//!
//! A [`Cancellable`] pairs a cancellation token with a delivery gate. Results
//! are handed to subscribers while holding the gate, and `cancel()` takes the
//! gate before flipping the token, so once `cancel()` returns no further
//! result can be delivered. The gate is reentrant: a handler may cancel its
//! own dispatch.

use parking_lot::ReentrantMutex;
use quarry_core::DispatchResult;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback receiving dispatch results.
pub type ResultHandler = Arc<dyn Fn(DispatchResult) + Send + Sync>;

/// Handle for cancelling one dispatch or watcher. Cloning shares the handle.
#[derive(Clone)]
pub struct Cancellable {
    token: CancellationToken,
    gate: Arc<ReentrantMutex<()>>,
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for Cancellable {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Stop further delivery and abandon in-flight work. Idempotent.
    pub fn cancel(&self) {
        let _gate = self.gate.lock();
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `deliver` unless cancelled. Returns whether it ran.
    pub(crate) fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            return false;
        }
        deliver();
        true
    }
}

/// Fan-out of results to the handlers of one dispatch.
pub(crate) struct ResultSink {
    handlers: Vec<ResultHandler>,
    cancel: Cancellable,
}

impl ResultSink {
    pub(crate) fn new(handlers: Vec<ResultHandler>, cancel: Cancellable) -> Self {
        Self { handlers, cancel }
    }

    /// Deliver `result` to every handler. Returns false if cancelled.
    pub(crate) fn emit(&self, result: DispatchResult) -> bool {
        self.cancel.deliver(|| {
            for handler in &self.handlers {
                handler(result.clone());
            }
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
