//! In-process subscriber registry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use super::{Broadcaster, InvalidationEvent};
use crate::error::Result;

/// Messages buffered per subscriber before it is considered not ready
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Fan-out registry of invalidation subscribers.
///
/// Each subscriber owns a bounded queue. Publishing never waits: a full
/// queue means the subscriber is skipped for that event, and a closed queue
/// (the [`Subscription`] was dropped) removes the subscriber.
pub struct InvalidationHub {
    subscribers: DashMap<u64, mpsc::Sender<Arc<str>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl InvalidationHub {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.insert(id, tx);
        debug!(subscriber = id, "subscriber registered");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send pre-serialized text to every ready subscriber
    pub fn publish_text(&self, text: Arc<str>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    trace!(subscriber = *entry.key(), "subscriber not ready, skipped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // removal happens after the iterator releases its shard locks
        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscriber = id, "subscriber gone, removed");
        }
        delivered
    }

    /// Publish an invalidation for `key`
    pub async fn broadcast(&self, key: &str) -> Result<usize> {
        self.publish(InvalidationEvent::invalidate(key)).await
    }
}

impl Default for InvalidationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InvalidationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationHub")
            .field("subscribers", &self.subscribers.len())
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

#[async_trait]
impl Broadcaster for InvalidationHub {
    async fn publish(&self, event: InvalidationEvent) -> Result<usize> {
        let text: Arc<str> = event.to_json()?.into();
        Ok(self.publish_text(text))
    }
}

/// Receiving end of a hub registration
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the hub dropped this subscriber
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let hub = InvalidationHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_ne!(a.id(), b.id());

        let delivered = hub.broadcast("user:1").await.unwrap();
        assert_eq!(delivered, 2);

        let expected = r#"{"action":"invalidate","key":"user:1"}"#;
        assert_eq!(a.recv().await.as_deref(), Some(expected));
        assert_eq!(b.recv().await.as_deref(), Some(expected));
    }

    #[tokio::test]
    async fn test_full_subscriber_is_skipped() {
        let hub = InvalidationHub::with_queue_depth(1);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        assert_eq!(hub.broadcast("k1").await.unwrap(), 2);
        fast.try_recv().unwrap();

        // slow still holds k1, so only fast gets k2
        assert_eq!(hub.broadcast("k2").await.unwrap(), 1);
        assert!(slow.try_recv().unwrap().contains("k1"));
        assert!(slow.try_recv().is_none());
        assert!(fast.try_recv().unwrap().contains("k2"));

        // still registered after being skipped
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscription_removed_on_publish() {
        let hub = InvalidationHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.broadcast("k").await.unwrap(), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(hub.unsubscribe(kept.id()));
        assert!(!hub.unsubscribe(kept.id()));
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let hub = InvalidationHub::new();
        assert_eq!(hub.broadcast("k").await.unwrap(), 0);
    }
}
