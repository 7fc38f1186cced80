//! Broadcaster Adapters
//!
//! Alternatives to the hub for logging, testing, and publishing to several
//! sinks at once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Broadcaster, InvalidationEvent};
use crate::error::Result;

/// Logging-based broadcaster.
///
/// Writes each invalidation to the tracing system. Reports zero deliveries.
#[derive(Debug, Clone, Default)]
pub struct LoggingBroadcaster {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broadcaster that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

#[async_trait]
impl Broadcaster for LoggingBroadcaster {
    async fn publish(&self, event: InvalidationEvent) -> Result<usize> {
        if self.info_level {
            info!(key = %event.key, action = ?event.action, "Cache invalidation");
        } else {
            debug!(key = %event.key, action = ?event.action, "Cache invalidation");
        }
        Ok(0)
    }
}

/// In-memory event collector for testing.
///
/// Collects events for later inspection; every publish counts as one
/// delivery.
#[derive(Debug, Default)]
pub struct InMemoryBroadcaster {
    events: parking_lot::RwLock<Vec<InvalidationEvent>>,
}

impl InMemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<InvalidationEvent> {
        self.events.read().clone()
    }

    /// Keys in publish order
    pub fn keys(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl Broadcaster for InMemoryBroadcaster {
    async fn publish(&self, event: InvalidationEvent) -> Result<usize> {
        self.events.write().push(event);
        Ok(1)
    }
}

/// Publishes to every inner broadcaster in order; deliveries are summed
#[derive(Default)]
pub struct CompositeBroadcaster {
    broadcasters: Vec<Arc<dyn Broadcaster>>,
}

impl CompositeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcasters.push(broadcaster);
        self
    }
}

impl std::fmt::Debug for CompositeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBroadcaster")
            .field("broadcaster_count", &self.broadcasters.len())
            .finish()
    }
}

#[async_trait]
impl Broadcaster for CompositeBroadcaster {
    async fn publish(&self, event: InvalidationEvent) -> Result<usize> {
        let mut delivered = 0;
        for broadcaster in &self.broadcasters {
            delivered += broadcaster.publish(event.clone()).await?;
        }
        Ok(delivered)
    }
}
