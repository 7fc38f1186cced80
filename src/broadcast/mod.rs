//! Invalidation Broadcasting
//!
//! When a key is deleted the coordinator publishes an [`InvalidationEvent`]
//! through a [`Broadcaster`]. The bundled [`InvalidationHub`] fans events out
//! to in-process subscribers and, through [`serve_websocket`], to external
//! WebSocket clients so co-located readers can evict their own copies.
//!
//! Wire format is one JSON text message per event:
//!
//! ```json
//! {"action":"invalidate","key":"user:42"}
//! ```

mod hub;
mod publisher;
mod websocket;

pub use hub::{InvalidationHub, Subscription, DEFAULT_QUEUE_DEPTH};
pub use publisher::{CompositeBroadcaster, InMemoryBroadcaster, LoggingBroadcaster};
pub use websocket::{serve_websocket, DEFAULT_WS_PORT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What happened to the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationAction {
    /// The key was removed; drop any local copy
    Invalidate,
}

/// Message sent to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub action: InvalidationAction,
    pub key: String,
}

impl InvalidationEvent {
    pub fn invalidate(key: impl Into<String>) -> Self {
        Self {
            action: InvalidationAction::Invalidate,
            key: key.into(),
        }
    }

    /// Serialize to the JSON text sent over the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sink for invalidation events.
///
/// Implementations must not block: a slow subscriber is skipped rather than
/// waited on.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `event`; returns how many subscribers received it
    async fn publish(&self, event: InvalidationEvent) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = InvalidationEvent::invalidate("user:42");
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"action":"invalidate","key":"user:42"}"#
        );

        let parsed: InvalidationEvent =
            serde_json::from_str(r#"{"action":"invalidate","key":"k"}"#).unwrap();
        assert_eq!(parsed, InvalidationEvent::invalidate("k"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(serde_json::from_str::<InvalidationEvent>(r#"{"action":"set","key":"k"}"#).is_err());
    }
}
