//! Memory Tier - In-Process LRU Cache
//!
//! Fastest tier. Entry-count bounded; when full, the least recently
//! *accessed* entry is evicted first. Expired entries are dropped eagerly
//! when a read finds them.
//!
//! Operations never suspend: the lock is a `parking_lot::Mutex` that is only
//! held for the duration of a map operation.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;

use super::entry::{validate_ttl, CacheEntry, TierKind};
use super::store::TierStore;
use super::DEFAULT_MEMORY_CAPACITY;
use crate::error::{Error, Result};

/// Memory tier configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

/// In-process LRU tier
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryStore {
    /// Create with default capacity
    pub fn new() -> Self {
        Self::with_capacity(NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }

    /// Create from configuration; zero capacity is rejected
    pub fn with_config(config: &MemoryConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity)
            .ok_or_else(|| Error::Config("memory tier capacity must be at least 1".into()))?;
        Ok(Self::with_capacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Insert or replace an entry
    pub fn insert(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        validate_ttl(ttl)?;
        let entry = CacheEntry::with_ttl(key, value, ttl);

        let displaced = self.entries.lock().push(key.to_string(), entry);
        if let Some((old_key, _)) = displaced {
            // push hands back either the replaced value for this key or the
            // evicted LRU entry
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(evicted = %old_key, "memory tier evicted LRU entry");
            }
        }
        Ok(())
    }

    /// Fetch a value, refreshing its recency
    pub fn lookup(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value().clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().pop(key)
    }

    /// Check for a live entry without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remaining lifetime of a live entry
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired())
            .and_then(CacheEntry::remaining_ttl)
    }

    /// Remove every entry
    pub fn purge(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierStore for MemoryStore {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.insert(key, value, ttl)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.lookup(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.purge();
        Ok(())
    }
}

/// Memory tier statistics
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// Number of live or not-yet-reaped entries
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Entries displaced by LRU
    pub evictions: u64,
    /// Entries dropped on read after their TTL passed
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
