//! Multi-Tier Cache
//!
//! A single key/value interface over up to three tiers:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     CacheCoordinator                      │
//! │  TagIndex · AccessOptimizer · RefreshScheduler · Metrics  │
//! └────────────┬──────────────────┬──────────────────┬────────┘
//!              │                  │                  │
//!        ┌─────▼─────┐     ┌──────▼──────┐    ┌──────▼──────┐
//!        │  Memory   │     │  Networked  │    │   Durable   │
//!        │   (LRU)   │ ──▶ │   (Redis)   │ ─▶ │ (Postgres)  │
//!        └───────────┘     └─────────────┘    └─────────────┘
//! ```
//!
//! Reads fall through fastest-first and stop at the first hit. Writes,
//! deletes and clears go to every configured tier concurrently; a failing
//! tier never blocks the others, and its failure is reported in a
//! [`FanOutReport`]. Consistency across tiers is eventual and best-effort.

pub mod codec;
pub mod compression;
mod coordinator;
mod durable;
mod entry;
mod memory;
mod metrics;
mod networked;
mod optimizer;
mod refresh;
mod store;
mod tags;

use std::time::Duration;

pub use codec::{CacheValue, ValueCodec};
pub use compression::{CompressionAlgorithm, CompressionConfig};
pub use coordinator::{CacheCoordinator, CoordinatorBuilder, CoordinatorConfig, SetOptions};
pub use durable::{PostgresConfig, PostgresStore};
pub use entry::{
    validate_key, validate_ttl, CacheEntry, TierKind, TierSet, MAX_KEY_LEN, MAX_TTL,
};
pub use memory::{MemoryConfig, MemoryStats, MemoryStore};
pub use metrics::{CacheMetrics, MetricsSnapshot, RefreshOutcome};
pub use networked::{RedisConfig, RedisStore};
pub use optimizer::{ttl_for_count, AccessOptimizer};
pub use refresh::{refresh_delay, RefreshClaim, RefreshScheduler, RefreshTicket};
pub use store::{FanOutReport, TierFailure, TierStore};
pub use tags::TagIndex;

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_CAPACITY: usize = 500;

/// Default number of keys whose access counts are tracked
pub const DEFAULT_ACCESS_TRACKING_CAPACITY: usize = 500;

/// Fraction of the TTL after which an auto-refresh fires
pub const REFRESH_FRACTION: f64 = 0.9;

/// TTL used when neither the caller nor the optimizer picks one
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
