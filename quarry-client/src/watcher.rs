//! Live watchers.
//!
//! A watcher binds one operation and one policy to its handlers. It runs an
//! initial dispatch, remembers the cache keys backing the delivered result,
//! and re-dispatches whenever a published change set intersects those keys.
//!
//! Each watcher runs its dispatches one at a time on its own task, so results
//! from a newer evaluation never precede results from an older one. Change
//! sets queued while a dispatch runs are coalesced into one re-dispatch.
//! Change sets produced by the watcher's own fetches are ignored.

use quarry_core::{CacheKey, CachePolicy, Operation};
use quarry_storage::{ChangeSet, ChangeSubscription};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::cancel::{Cancellable, ResultHandler, ResultSink};
use crate::dispatcher::Dispatcher;

#[derive(Debug)]
enum Command {
    Refetch(CachePolicy),
}

enum Event {
    Cancelled,
    Command(Command),
    Change(Arc<ChangeSet>),
}

/// Handle to a running watcher.
///
/// Dropping the handle cancels the watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    id: Uuid,
    cancel: Cancellable,
    commands: mpsc::UnboundedSender<Command>,
}

impl WatcherHandle {
    /// Identifier used as the origin of this watcher's own writes.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the watcher. No result is delivered after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Re-dispatch once with `policy`, keeping the bound policy for later
    /// re-evaluations. Returns false if the watcher has stopped.
    pub fn refetch(&self, policy: CachePolicy) -> bool {
        !self.cancel.is_cancelled() && self.commands.send(Command::Refetch(policy)).is_ok()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchTask {
    id: Uuid,
    dispatcher: Dispatcher,
    operation: Arc<dyn Operation>,
    policy: CachePolicy,
    sink: ResultSink,
    changes: ChangeSubscription,
    commands: mpsc::UnboundedReceiver<Command>,
    dependencies: HashSet<CacheKey>,
}

/// Subscribe to changes, then spawn the watcher task.
///
/// The subscription is taken before the initial dispatch so no change made
/// during it is missed.
pub(crate) fn start(
    dispatcher: Dispatcher,
    operation: Arc<dyn Operation>,
    policy: CachePolicy,
    handlers: Vec<ResultHandler>,
) -> WatcherHandle {
    let id = Uuid::now_v7();
    let cancel = Cancellable::new();
    let (commands_tx, commands) = mpsc::unbounded_channel();

    let task = WatchTask {
        id,
        changes: dispatcher.cache().subscribe(),
        dispatcher,
        operation,
        policy,
        sink: ResultSink::new(handlers, cancel.clone()),
        commands,
        dependencies: HashSet::new(),
    };
    tokio::spawn(task.run());

    WatcherHandle {
        id,
        cancel,
        commands: commands_tx,
    }
}

impl WatchTask {
    async fn run(mut self) {
        trace!(watcher_id = %self.id, operation = self.operation.name(), "Watcher started");
        self.evaluate(self.policy).await;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.sink.cancelled() => Event::Cancelled,
                Some(command) = self.commands.recv() => Event::Command(command),
                // The subscription keeps the feed alive, so it never closes.
                Some(change) = self.changes.recv() => Event::Change(change),
            };

            match event {
                Event::Cancelled => break,
                Event::Command(Command::Refetch(policy)) => {
                    trace!(watcher_id = %self.id, policy = %policy, "Watcher refetch");
                    self.evaluate(policy).await;
                }
                Event::Change(change) => {
                    let mut relevant = self.is_relevant(&change);
                    while let Some(queued) = self.changes.try_recv() {
                        relevant |= self.is_relevant(&queued);
                    }
                    if relevant {
                        trace!(
                            watcher_id = %self.id,
                            sequence = change.sequence,
                            "Dependencies changed, re-dispatching"
                        );
                        self.evaluate(self.policy).await;
                    }
                }
            }
        }

        trace!(watcher_id = %self.id, "Watcher stopped");
    }

    fn is_relevant(&self, change: &ChangeSet) -> bool {
        !change.is_from(self.id) && change.intersects(&self.dependencies)
    }

    /// Dispatch once and re-capture dependencies from the delivered result.
    ///
    /// Without any delivered result, the normalizer's entry keys stand in so
    /// a watcher that started on a miss wakes once its data is written.
    async fn evaluate(&mut self, policy: CachePolicy) {
        let delivered = self
            .dispatcher
            .execute(&self.operation, policy, &self.sink, Some(self.id))
            .await;

        match delivered {
            Some(keys) => self.dependencies = keys,
            None if self.dependencies.is_empty() => {
                self.dependencies = self
                    .dispatcher
                    .cache()
                    .normalizer()
                    .entry_keys(self.operation.as_ref());
            }
            None => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{DispatchResult, GraphError, GraphResponse, RecordSet};
    use quarry_storage::{MemoryRecordStore, NormalizedCache};
    use quarry_test_utils::{fixtures, init_tracing, MockTransport, RootFieldNormalizer};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        dispatcher: Dispatcher,
        transport: Arc<MockTransport>,
        results: mpsc::UnboundedReceiver<DispatchResult>,
        handler: ResultHandler,
    }

    fn harness(transport: MockTransport) -> Harness {
        init_tracing();
        let transport = Arc::new(transport);
        let cache = Arc::new(NormalizedCache::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(RootFieldNormalizer::new()),
        ));
        let (sender, results) = mpsc::unbounded_channel();
        let handler: ResultHandler = Arc::new(move |result: DispatchResult| {
            let _ = sender.send(result);
        });
        Harness {
            dispatcher: Dispatcher::new(cache, transport.clone()),
            transport,
            results,
            handler,
        }
    }

    async fn seed(dispatcher: &Dispatcher, name: &str) {
        let op = fixtures::hero_query();
        let records = dispatcher
            .cache()
            .normalize(op.as_ref(), &fixtures::hero_payload(name));
        dispatcher
            .cache()
            .merge(records)
            .await
            .expect("seed merge should succeed");
    }

    fn record(key: &str, value: serde_json::Value) -> RecordSet {
        [(CacheKey::from(key), value)].into_iter().collect()
    }

    async fn next(results: &mut mpsc::UnboundedReceiver<DispatchResult>) -> DispatchResult {
        timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("result should arrive in time")
            .expect("channel should be open")
    }

    async fn quiet(results: &mut mpsc::UnboundedReceiver<DispatchResult>) -> bool {
        timeout(Duration::from_millis(150), results.recv()).await.is_err()
    }

    #[tokio::test]
    async fn test_change_inside_dependencies_triggers_one_redispatch() {
        let mut h = harness(MockTransport::new());
        seed(&h.dispatcher, "Luke").await;

        let watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        let first = next(&mut h.results).await.expect("initial result");
        assert_eq!(first.data, Some(fixtures::hero_payload("Luke")));

        h.dispatcher
            .cache()
            .merge(record("Hero:1", json!({"id": "Hero:1", "name": "Leia"})))
            .await
            .expect("merge should succeed");

        let second = next(&mut h.results).await.expect("re-dispatched result");
        assert_eq!(second.data, Some(fixtures::hero_payload("Leia")));
        assert!(quiet(&mut h.results).await, "exactly one re-dispatch");
        assert_eq!(h.transport.call_count(), 0);
        watcher.cancel();
    }

    #[tokio::test]
    async fn test_change_outside_dependencies_is_ignored() {
        let mut h = harness(MockTransport::new());
        seed(&h.dispatcher, "Luke").await;

        let _watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        next(&mut h.results).await.expect("initial result");

        h.dispatcher
            .cache()
            .merge(record("Droid:2", json!({"id": "Droid:2", "name": "R2-D2"})))
            .await
            .expect("merge should succeed");

        assert!(quiet(&mut h.results).await);
    }

    #[tokio::test]
    async fn test_cancelled_watcher_delivers_nothing() {
        let mut h = harness(MockTransport::new());
        seed(&h.dispatcher, "Luke").await;

        let watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        next(&mut h.results).await.expect("initial result");

        watcher.cancel();
        watcher.cancel();
        assert!(watcher.is_cancelled());

        h.dispatcher
            .cache()
            .merge(record("Hero:1", json!({"id": "Hero:1", "name": "Leia"})))
            .await
            .expect("merge should succeed");

        assert!(quiet(&mut h.results).await);
        assert!(!watcher.refetch(CachePolicy::CacheOnly));
    }

    #[tokio::test]
    async fn test_own_fetch_does_not_retrigger() {
        let transport = MockTransport::new().with_repeat(Ok(fixtures::hero_response("Leia")));
        let mut h = harness(transport);
        seed(&h.dispatcher, "Luke").await;

        let _watcher = h.dispatcher.watch(
            fixtures::hero_query(),
            CachePolicy::CacheThenFetch,
            vec![h.handler.clone()],
        );

        let cached = next(&mut h.results).await.expect("cached result");
        assert!(cached.is_from_cache());
        let fetched = next(&mut h.results).await.expect("fetched result");
        assert!(!fetched.is_from_cache());

        assert!(quiet(&mut h.results).await);
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_watcher_started_on_miss_wakes_on_write() {
        let mut h = harness(MockTransport::new());

        let _watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        assert!(next(&mut h.results).await.unwrap_err().is_cache_miss());

        seed(&h.dispatcher, "Luke").await;
        let result = next(&mut h.results).await.expect("result after write");
        assert_eq!(result.data, Some(fixtures::hero_payload("Luke")));
    }

    #[tokio::test]
    async fn test_refetch_uses_one_off_policy() {
        let transport = MockTransport::new().with_repeat(Ok(fixtures::hero_response("Leia")));
        let mut h = harness(transport);
        seed(&h.dispatcher, "Luke").await;

        let watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        next(&mut h.results).await.expect("initial result");
        assert_eq!(h.transport.call_count(), 0);

        assert!(watcher.refetch(CachePolicy::FetchOnly));
        let fetched = next(&mut h.results).await.expect("refetched result");
        assert!(!fetched.is_from_cache());
        assert_eq!(h.transport.call_count(), 1);
        assert!(quiet(&mut h.results).await);
    }

    #[tokio::test]
    async fn test_errors_only_fetch_keeps_dependencies() {
        let transport = MockTransport::new().with_response(
            GraphResponse::default().with_error(GraphError::new("hero resolver failed")),
        );
        let mut h = harness(transport);
        seed(&h.dispatcher, "Luke").await;

        let _watcher = h.dispatcher.watch(
            fixtures::hero_query(),
            CachePolicy::CacheThenFetch,
            vec![h.handler.clone()],
        );
        let cached = next(&mut h.results).await.expect("cached result");
        assert!(cached.is_from_cache());
        let failed = next(&mut h.results).await.expect("errors-only result");
        assert!(failed.data.is_none());
        assert_eq!(failed.errors.len(), 1);

        h.dispatcher
            .cache()
            .merge(record("Hero:1", json!({"id": "Hero:1", "name": "Leia"})))
            .await
            .expect("merge should succeed");

        let refreshed = next(&mut h.results).await.expect("re-dispatched result");
        assert!(refreshed.is_from_cache());
        assert_eq!(refreshed.data, Some(fixtures::hero_payload("Leia")));
    }

    #[tokio::test]
    async fn test_drop_cancels_watcher() {
        let mut h = harness(MockTransport::new());
        seed(&h.dispatcher, "Luke").await;

        let watcher = h
            .dispatcher
            .watch(fixtures::hero_query(), CachePolicy::CacheOnly, vec![h.handler.clone()]);
        next(&mut h.results).await.expect("initial result");
        drop(watcher);

        h.dispatcher
            .cache()
            .merge(record("Hero:1", json!({"id": "Hero:1", "name": "Leia"})))
            .await
            .expect("merge should succeed");
        assert!(quiet(&mut h.results).await);

        // The task unregisters its subscription once it observes cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.dispatcher.cache().feed().subscriber_count(), 0);
    }
}
