//! Change feed: publisher side of cache change notifications.
//!
//! Every write that changes at least one record publishes a [`ChangeSet`].
//! Subscribers hold a [`ChangeSubscription`] and filter change sets by
//! intersecting them with their own dependency keys.
//!
//! # Ordering
//!
//! Sequence assignment and delivery happen under one lock, so every
//! subscriber receives change sets in strictly increasing sequence order.
//! Channels are unbounded; publishing never waits on a slow subscriber.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quarry_core::CacheKey;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// One published set of changed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Strictly increasing per feed.
    pub sequence: u64,
    pub keys: HashSet<CacheKey>,
    /// Writer that produced the change, when it identified itself.
    pub origin: Option<Uuid>,
    pub published_at: DateTime<Utc>,
}

impl ChangeSet {
    /// True if any changed key is in `keys`.
    pub fn intersects(&self, keys: &HashSet<CacheKey>) -> bool {
        if self.keys.len() <= keys.len() {
            self.keys.iter().any(|k| keys.contains(k))
        } else {
            keys.iter().any(|k| self.keys.contains(k))
        }
    }

    pub fn is_from(&self, origin: Uuid) -> bool {
        self.origin == Some(origin)
    }
}

#[derive(Debug, Default)]
struct FeedInner {
    subscribers: DashMap<u64, mpsc::UnboundedSender<Arc<ChangeSet>>>,
    next_subscriber: AtomicU64,
    sequence: Mutex<u64>,
}

/// Registry of change subscribers.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `keys` to every subscriber.
    ///
    /// Returns `None` without consuming a sequence number when `keys` is empty.
    pub fn publish(&self, keys: HashSet<CacheKey>, origin: Option<Uuid>) -> Option<Arc<ChangeSet>> {
        if keys.is_empty() {
            return None;
        }

        let mut sequence = self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;

        let change = Arc::new(ChangeSet {
            sequence: *sequence,
            keys,
            origin,
            published_at: Utc::now(),
        });

        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if entry.value().send(change.clone()).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }

        trace!(
            sequence = change.sequence,
            keys = change.keys.len(),
            subscribers = self.inner.subscribers.len(),
            "Published change set"
        );
        Some(change)
    }

    /// Register a subscriber. It receives every change published afterwards.
    pub fn subscribe(&self) -> ChangeSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(id, sender);

        ChangeSubscription {
            id,
            receiver,
            feed: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Sequence number of the most recent change set, or 0.
    pub fn last_sequence(&self) -> u64 {
        *self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a change feed registration.
///
/// When dropped, the subscriber is unregistered from the feed.
#[derive(Debug)]
pub struct ChangeSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Arc<ChangeSet>>,
    feed: Arc<FeedInner>,
}

impl ChangeSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next change set.
    pub async fn recv(&mut self) -> Option<Arc<ChangeSet>> {
        self.receiver.recv().await
    }

    /// Take a change set if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<ChangeSet>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.feed.subscribers.remove(&self.id);
        trace!(subscriber_id = self.id, "Change subscriber unregistered");
    }
}
