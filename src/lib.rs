//! tiercache - Multi-Tier Cache Coordinator
//!
//! One key/value interface over an in-process LRU, Redis and PostgreSQL,
//! with read fallthrough, tag-based group invalidation, TTL expiry and
//! optional refresh shortly before expiry. Deletes are broadcast to
//! subscribers so co-located readers can evict their local copies.
//!
//! # Architecture
//!
//! ```text
//! caller → CacheCoordinator → memory → networked → durable
//!                │
//!                └─ delete → Broadcaster → WebSocket subscribers
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{CacheCoordinator, SetOptions};
//!
//! # async fn demo() -> tiercache::Result<()> {
//! let cache = CacheCoordinator::builder().build().await?;
//! cache
//!     .set_text("greeting", "hello", SetOptions::with_ttl(Duration::from_secs(30)))
//!     .await?;
//! assert_eq!(cache.get_text("greeting").await?.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, codec, tag index, refresh scheduling and the coordinator
//! - [`broadcast`] - Invalidation events, subscriber hub and WebSocket bridge
//! - [`error`] - Error types

pub mod broadcast;
pub mod cache;
pub mod error;

// Re-export commonly used types
pub use broadcast::{Broadcaster, InvalidationEvent, InvalidationHub};
pub use cache::{
    CacheCoordinator, CacheValue, CoordinatorConfig, FanOutReport, SetOptions, TierKind, TierSet,
    TierStore,
};
pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
