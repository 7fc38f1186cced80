//! Cache Entry Types
//!
//! Entries held by the in-process tier, plus the tier identifiers shared by
//! every component.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest key accepted by any tier (Redis and PostgreSQL both cope with far
/// more, but keys this long are almost always a bug upstream).
pub const MAX_KEY_LEN: usize = 1024;

/// Longest TTL accepted: one hundred years. Far below what Redis expiry
/// times or PostgreSQL intervals overflow on.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Storage tier identifier, in fallthrough priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process LRU memory
    Memory,
    /// Networked key-value cache (Redis)
    Networked,
    /// Durable database (PostgreSQL)
    Durable,
}

impl TierKind {
    /// All tiers, fastest first
    pub const ALL: [TierKind; 3] = [TierKind::Memory, TierKind::Networked, TierKind::Durable];

    /// Metric label / config name
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Networked => "networked",
            TierKind::Durable => "durable",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TierKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" | "l1" => Ok(TierKind::Memory),
            "networked" | "redis" | "l2" => Ok(TierKind::Networked),
            "durable" | "database" | "postgres" | "l3" => Ok(TierKind::Durable),
            other => Err(Error::Config(format!("unknown tier: {other}"))),
        }
    }
}

/// The configured subset of tiers, always iterated fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TierSet {
    memory: bool,
    networked: bool,
    durable: bool,
}

impl TierSet {
    /// Empty set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Memory tier only
    pub fn memory_only() -> Self {
        Self::empty().with(TierKind::Memory)
    }

    /// Every tier
    pub fn all() -> Self {
        TierKind::ALL.into_iter().collect()
    }

    /// Add a tier
    pub fn with(mut self, tier: TierKind) -> Self {
        match tier {
            TierKind::Memory => self.memory = true,
            TierKind::Networked => self.networked = true,
            TierKind::Durable => self.durable = true,
        }
        self
    }

    /// Check membership
    pub fn contains(&self, tier: TierKind) -> bool {
        match tier {
            TierKind::Memory => self.memory,
            TierKind::Networked => self.networked,
            TierKind::Durable => self.durable,
        }
    }

    /// Iterate in priority order
    pub fn iter(&self) -> impl Iterator<Item = TierKind> + '_ {
        TierKind::ALL.into_iter().filter(|t| self.contains(*t))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<TierKind> for TierSet {
    fn from_iter<I: IntoIterator<Item = TierKind>>(iter: I) -> Self {
        iter.into_iter().fold(TierSet::empty(), TierSet::with)
    }
}

impl std::fmt::Display for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.iter().map(|t| t.name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Entry held by the in-process tier
#[derive(Clone, Debug)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    /// Create an entry expiring `ttl` from now; a TTL past the end of the
    /// monotonic clock never expires
    pub fn with_ttl(key: impl Into<String>, value: Bytes, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Encoded value (zero-copy clone)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Check if expired at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry, `None` for entries without a TTL
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Reject keys no tier can store sensibly.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key length {} exceeds maximum of {MAX_KEY_LEN} bytes",
            key.len()
        )));
    }
    Ok(())
}

/// TTLs must be strictly positive and at most [`MAX_TTL`].
pub fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::Validation("ttl must be a positive duration".into()));
    }
    if ttl > MAX_TTL {
        return Err(Error::Validation(format!(
            "ttl of {}s exceeds maximum of {}s",
            ttl.as_secs(),
            MAX_TTL.as_secs()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
