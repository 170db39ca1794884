//! Cache-policy dispatch.
//!
//! One dispatch runs one operation under one [`CachePolicy`]:
//!
//! | Policy | Cache read | Fetch | Merge | Miss reported | Fetch error after hit |
//! |---|---|---|---|---|---|
//! | `CacheThenFetch` | yes | yes | yes | no | suppressed |
//! | `FetchOnly` | no | yes | yes | n/a | n/a |
//! | `FetchOnlyNoStore` | no | yes | no | n/a | n/a |
//! | `CacheOnly` | yes | no | no | yes | n/a |
//! | `CacheThenFetchAlways` | yes | yes | yes | yes | reported |
//!
//! Storage errors end the dispatch with that error as its last result.
//! Dispatches never retry.

use quarry_core::{
    CacheKey, CachePolicy, DispatchError, DispatchResult, GraphResponse, Operation,
    OperationResult, QuarryResult, RequestContext, Transport, TransportRequest,
};
use quarry_storage::NormalizedCache;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::cancel::{Cancellable, ResultHandler, ResultSink};
use crate::watcher::{self, WatcherHandle};

/// Runs operations against a normalized cache and a transport.
///
/// Cloning is cheap; clones share the cache and transport. Dispatches are
/// spawned onto the current tokio runtime.
#[derive(Clone)]
pub struct Dispatcher {
    cache: Arc<NormalizedCache>,
    transport: Arc<dyn Transport>,
    context: RequestContext,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cache", &self.cache)
            .field("context", &self.context)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(cache: Arc<NormalizedCache>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache,
            transport,
            context: RequestContext::default(),
        }
    }

    /// Set the context sent with every transport request.
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn cache(&self) -> &Arc<NormalizedCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Dispatch `operation` and stream its results.
    pub fn dispatch(&self, operation: Arc<dyn Operation>, policy: CachePolicy) -> DispatchStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler: ResultHandler = Arc::new(move |result: DispatchResult| {
            let _ = sender.send(result);
        });
        let cancel = self.dispatch_to(operation, policy, vec![handler]);
        DispatchStream { receiver, cancel }
    }

    /// Dispatch `operation`, delivering every result to each handler in order.
    pub fn dispatch_to(
        &self,
        operation: Arc<dyn Operation>,
        policy: CachePolicy,
        handlers: Vec<ResultHandler>,
    ) -> Cancellable {
        let cancel = Cancellable::new();
        let sink = ResultSink::new(handlers, cancel.clone());
        let dispatcher = self.clone();

        tokio::spawn(async move {
            dispatcher.execute(&operation, policy, &sink, None).await;
            // Release the cache before the handlers see the end of the stream.
            drop(dispatcher);
            drop(sink);
        });

        cancel
    }

    /// Start a watcher re-dispatching `operation` whenever its data changes.
    pub fn watch(
        &self,
        operation: Arc<dyn Operation>,
        policy: CachePolicy,
        handlers: Vec<ResultHandler>,
    ) -> WatcherHandle {
        watcher::start(self.clone(), operation, policy, handlers)
    }

    /// Run the policy state machine for one dispatch.
    ///
    /// `origin` tags the change set published by this dispatch's merge.
    /// Returns the dependent keys of the last successful result delivered
    /// that carried data.
    pub(crate) async fn execute(
        &self,
        operation: &Arc<dyn Operation>,
        policy: CachePolicy,
        sink: &ResultSink,
        origin: Option<Uuid>,
    ) -> Option<HashSet<CacheKey>> {
        let name = operation.name();
        let mut delivered = None;
        let mut cache_hit = false;

        debug!(operation = name, policy = %policy, "Dispatching");

        if policy.reads_cache() {
            match self.cache.load(operation.as_ref()).await {
                Ok(Some(cached)) => {
                    cache_hit = true;
                    let keys = cached.dependent_keys.clone();
                    if sink.emit(Ok(OperationResult::from_cache(cached.data, cached.dependent_keys))) {
                        delivered = Some(keys);
                    }
                }
                Ok(None) => {
                    if policy.reports_cache_miss() {
                        sink.emit(Err(DispatchError::CacheMiss {
                            operation: name.to_string(),
                        }
                        .into()));
                    }
                }
                Err(e) => {
                    sink.emit(Err(e));
                    return delivered;
                }
            }
        }

        if !policy.fetches() {
            return delivered;
        }
        if sink.is_cancelled() {
            debug!(operation = name, "Cancelled before fetch");
            return delivered;
        }

        let response = tokio::select! {
            biased;
            _ = sink.cancelled() => {
                debug!(operation = name, "Cancelled during fetch");
                return delivered;
            }
            response = self.send(operation, policy) => response,
        };

        match response {
            Ok(response) => {
                let (keys, stored) = self.absorb(operation.as_ref(), &response, policy, sink, origin).await;
                if let Err(e) = stored {
                    sink.emit(Err(e));
                    return delivered;
                }
                // An errors-only response is backed by no records and keeps
                // the previous dependencies.
                let backed = response.data.is_some();
                if sink.emit(Ok(OperationResult::from_server(response, keys.clone()))) && backed {
                    delivered = Some(keys);
                }
            }
            Err(e) if cache_hit && policy.suppresses_fetch_error_after_hit() => {
                debug!(operation = name, error = %e, "Suppressed fetch failure after cache hit");
            }
            Err(e) => {
                sink.emit(Err(e));
            }
        }

        delivered
    }

    /// Normalize a fetched response and merge it when the policy writes.
    async fn absorb(
        &self,
        operation: &dyn Operation,
        response: &GraphResponse,
        policy: CachePolicy,
        sink: &ResultSink,
        origin: Option<Uuid>,
    ) -> (HashSet<CacheKey>, QuarryResult<()>) {
        let Some(data) = response.data.as_ref() else {
            return (HashSet::new(), Ok(()));
        };

        let records = self.cache.normalize(operation, data);
        let keys: HashSet<CacheKey> = records.keys().cloned().collect();

        if !policy.writes_result() || sink.is_cancelled() {
            return (keys, Ok(()));
        }

        let stored = self.cache.merge_from(records, origin).await.map(drop);
        (keys, stored)
    }

    async fn send(&self, operation: &Arc<dyn Operation>, policy: CachePolicy) -> QuarryResult<GraphResponse> {
        let request = TransportRequest {
            operation: operation.clone(),
            policy,
            context: self.context.clone(),
        };

        let uploads = operation.uploads();
        if uploads.is_empty() {
            return Ok(self.transport.send(request).await?);
        }

        let Some(uploader) = self.transport.upload_capability() else {
            return Err(DispatchError::NoUploadCapability {
                operation: operation.name().to_string(),
            }
            .into());
        };
        Ok(uploader.upload(request, uploads.to_vec()).await?)
    }
}

/// Results of one dispatch, in delivery order.
#[derive(Debug)]
pub struct DispatchStream {
    receiver: mpsc::UnboundedReceiver<DispatchResult>,
    cancel: Cancellable,
}

impl DispatchStream {
    /// Next result, or `None` once the dispatch has finished or was cancelled.
    pub async fn next(&mut self) -> Option<DispatchResult> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.recv().await
    }

    /// Wait for the dispatch to finish and return every result.
    pub async fn collect(mut self) -> Vec<DispatchResult> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle cancelling this dispatch from elsewhere.
    pub fn cancellable(&self) -> Cancellable {
        self.cancel.clone()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<DispatchResult> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

// ============================================================================
// TESTS
// ============================================================================
