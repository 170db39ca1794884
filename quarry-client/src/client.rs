//! Client façade bundling store, cache, transport, and configuration.

use quarry_core::{
    CachePolicy, DispatchError, DispatchResult, Normalizer, Operation, QuarryConfig, QuarryResult,
    RequestContext, Transport,
};
use quarry_storage::{LmdbRecordStore, NormalizedCache, RecordStore};
use std::sync::Arc;
use tracing::info;

use crate::cancel::{Cancellable, ResultHandler};
use crate::dispatcher::{DispatchStream, Dispatcher};
use crate::watcher::WatcherHandle;

/// Entry point for running operations against a cached remote endpoint.
///
/// # Example
///
/// ```ignore
/// use quarry_client::QuarryClient;
/// use quarry_core::{CachePolicy, OperationRequest, QuarryConfig};
///
/// let client = QuarryClient::open(QuarryConfig::from_env(), transport, normalizer)?;
/// let op = Arc::new(OperationRequest::query("HeroName", "{ hero { name } }"));
/// let results = client.fetch(op, CachePolicy::CacheThenFetch).collect().await;
/// ```
#[derive(Debug, Clone)]
pub struct QuarryClient {
    dispatcher: Dispatcher,
    config: QuarryConfig,
}

impl QuarryClient {
    /// Validate `config` and open an LMDB-backed client.
    pub fn open(
        config: QuarryConfig,
        transport: Arc<dyn Transport>,
        normalizer: Arc<dyn Normalizer>,
    ) -> QuarryResult<Self> {
        config.validate()?;
        let store = LmdbRecordStore::open(&config.store.path, config.store.map_size_mb)?;
        Ok(Self::new(config, Arc::new(store), transport, normalizer))
    }

    /// Build a client over any record store.
    pub fn new(
        config: QuarryConfig,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Self {
        let cache = NormalizedCache::new(store, normalizer)
            .with_max_resolution_rounds(config.max_resolution_rounds);

        let mut context = RequestContext::new();
        if let Some(timeout) = config.request_timeout() {
            context = context.with_timeout(timeout);
        }

        info!(
            fetch_policy = %config.default_fetch_policy,
            watch_policy = %config.default_watch_policy,
            "Quarry client ready"
        );

        Self {
            dispatcher: Dispatcher::new(Arc::new(cache), transport).with_context(context),
            config,
        }
    }

    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<NormalizedCache> {
        self.dispatcher.cache()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run `operation` under `policy`.
    pub fn fetch(&self, operation: Arc<dyn Operation>, policy: CachePolicy) -> DispatchStream {
        self.dispatcher.dispatch(operation, policy)
    }

    pub fn fetch_with_default_policy(&self, operation: Arc<dyn Operation>) -> DispatchStream {
        self.fetch(operation, self.config.default_fetch_policy)
    }

    /// Run `operation` under `policy`, delivering to every handler.
    pub fn fetch_to(
        &self,
        operation: Arc<dyn Operation>,
        policy: CachePolicy,
        handlers: Vec<ResultHandler>,
    ) -> Cancellable {
        self.dispatcher.dispatch_to(operation, policy, handlers)
    }

    /// Watch `operation`. Without a policy the configured watch policy is used.
    pub fn watch(
        &self,
        operation: Arc<dyn Operation>,
        policy: Option<CachePolicy>,
        handler: impl Fn(DispatchResult) + Send + Sync + 'static,
    ) -> WatcherHandle {
        let policy = policy.unwrap_or(self.config.default_watch_policy);
        let handler: ResultHandler = Arc::new(handler);
        self.dispatcher.watch(operation, policy, vec![handler])
    }

    /// Send a mutation. With `store_result` its result is merged into the
    /// cache, which re-evaluates any watcher depending on the written keys.
    pub fn perform(&self, mutation: Arc<dyn Operation>, store_result: bool) -> DispatchStream {
        let policy = if store_result {
            CachePolicy::FetchOnly
        } else {
            CachePolicy::FetchOnlyNoStore
        };
        self.fetch(mutation, policy)
    }

    /// Send an operation carrying files.
    ///
    /// Fails up front with `NoUploadCapability` if the transport cannot upload.
    pub fn upload(
        &self,
        operation: Arc<dyn Operation>,
        store_result: bool,
    ) -> QuarryResult<DispatchStream> {
        if self.dispatcher.transport().upload_capability().is_none() {
            return Err(DispatchError::NoUploadCapability {
                operation: operation.name().to_string(),
            }
            .into());
        }
        Ok(self.perform(operation, store_result))
    }

    /// Remove every cached record, optionally compacting the store.
    ///
    /// Compaction blocks; quiesce other cache traffic first.
    pub async fn clear_cache(&self, compact: bool) -> QuarryResult<()> {
        self.cache().clear(compact).await
    }
}
