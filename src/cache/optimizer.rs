//! Access Optimizer
//!
//! Counts reads per key in a bounded LRU table and turns the count into a
//! default TTL for writes that don't specify one. Purely advisory: it never
//! changes the TTL of an entry that is already stored.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use super::DEFAULT_ACCESS_TRACKING_CAPACITY;

/// Accesses above which a key is considered hot
pub const HOT_ACCESS_THRESHOLD: u64 = 50;
/// Accesses above which a key is considered warm
pub const WARM_ACCESS_THRESHOLD: u64 = 20;

/// TTL recommended for hot keys
pub const HOT_TTL: Duration = Duration::from_secs(600);
/// TTL recommended for warm keys
pub const WARM_TTL: Duration = Duration::from_secs(300);
/// TTL recommended for everything else
pub const COLD_TTL: Duration = Duration::from_secs(60);

/// Frequency-based TTL advisor
pub struct AccessOptimizer {
    counts: Mutex<LruCache<String, u64>>,
}

impl AccessOptimizer {
    pub fn new() -> Self {
        Self::with_capacity(
            NonZeroUsize::new(DEFAULT_ACCESS_TRACKING_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            counts: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one access and return the new count
    pub fn track_access(&self, key: &str) -> u64 {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count += 1;
            return *count;
        }
        counts.put(key.to_string(), 1);
        1
    }

    /// Current count, without refreshing the key's recency
    pub fn access_count(&self, key: &str) -> u64 {
        self.counts.lock().peek(key).copied().unwrap_or(0)
    }

    /// TTL to use when the caller gives none
    pub fn recommended_ttl(&self, key: &str) -> Duration {
        ttl_for_count(self.access_count(key))
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.counts.lock().len()
    }
}

impl Default for AccessOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an access count to a TTL tier
pub fn ttl_for_count(count: u64) -> Duration {
    if count > HOT_ACCESS_THRESHOLD {
        HOT_TTL
    } else if count > WARM_ACCESS_THRESHOLD {
        WARM_TTL
    } else {
        COLD_TTL
    }
}
