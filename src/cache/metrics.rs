//! Cache Metrics Collection
//!
//! Per-tier hit/miss/failure counters plus refresh and invalidation
//! counters. Each coordinator owns its own registry so several coordinators
//! (and tests) can coexist in one process.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use super::entry::TierKind;
use super::memory::MemoryStats;
use crate::error::{Error, Result};

/// Outcome label for refresh counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Producer ran and the key was re-set
    Refreshed,
    /// Producer returned an error
    Failed,
    /// Cancelled by delete, clear or a newer set
    Cancelled,
}

impl RefreshOutcome {
    fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::Failed => "failed",
            RefreshOutcome::Cancelled => "cancelled",
        }
    }
}

/// Cache metrics collector
pub struct CacheMetrics {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    failures: IntCounterVec,
    refreshes: IntCounterVec,
    invalidations: IntCounter,
    codec_errors: IntCounter,
    memory_entries: IntGauge,
    memory_evictions: IntGauge,
}

impl CacheMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("tiercache_tier_hits_total", "Reads served by a tier"),
            &["tier"],
        )
        .map_err(metric_error)?;
        let misses = IntCounterVec::new(
            Opts::new("tiercache_tier_misses_total", "Reads a tier could not serve"),
            &["tier"],
        )
        .map_err(metric_error)?;
        let failures = IntCounterVec::new(
            Opts::new("tiercache_tier_failures_total", "Tier operations that returned an error"),
            &["tier", "op"],
        )
        .map_err(metric_error)?;
        let refreshes = IntCounterVec::new(
            Opts::new("tiercache_refreshes_total", "Auto-refresh task outcomes"),
            &["outcome"],
        )
        .map_err(metric_error)?;
        let invalidations = IntCounter::new(
            "tiercache_invalidations_total",
            "Invalidation events handed to the broadcaster",
        )
        .map_err(metric_error)?;
        let codec_errors = IntCounter::new(
            "tiercache_codec_errors_total",
            "Values that failed to decode on read",
        )
        .map_err(metric_error)?;
        let memory_entries = IntGauge::new(
            "tiercache_memory_entries",
            "Entries currently held by the memory tier",
        )
        .map_err(metric_error)?;
        let memory_evictions = IntGauge::new(
            "tiercache_memory_evictions",
            "Entries the memory tier has evicted for capacity",
        )
        .map_err(metric_error)?;

        for collector in [
            Box::new(hits.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(misses.clone()),
            Box::new(failures.clone()),
            Box::new(refreshes.clone()),
            Box::new(invalidations.clone()),
            Box::new(codec_errors.clone()),
            Box::new(memory_entries.clone()),
            Box::new(memory_evictions.clone()),
        ] {
            registry.register(collector).map_err(metric_error)?;
        }

        Ok(Self {
            registry,
            hits,
            misses,
            failures,
            refreshes,
            invalidations,
            codec_errors,
            memory_entries,
            memory_evictions,
        })
    }

    pub fn record_hit(&self, tier: TierKind) {
        self.hits.with_label_values(&[tier.name()]).inc();
    }

    pub fn record_miss(&self, tier: TierKind) {
        self.misses.with_label_values(&[tier.name()]).inc();
    }

    pub fn record_failure(&self, tier: TierKind, op: &str) {
        self.failures.with_label_values(&[tier.name(), op]).inc();
    }

    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        self.refreshes.with_label_values(&[outcome.label()]).inc();
    }

    pub fn record_invalidation(&self) {
        self.invalidations.inc();
    }

    pub fn record_codec_error(&self) {
        self.codec_errors.inc();
    }

    /// Copy memory tier gauges from its own counters
    pub fn update_memory_stats(&self, stats: &MemoryStats) {
        self.memory_entries.set(stats.entries as i64);
        self.memory_evictions.set(stats.evictions as i64);
    }

    pub fn hits(&self, tier: TierKind) -> u64 {
        self.hits.with_label_values(&[tier.name()]).get()
    }

    pub fn misses(&self, tier: TierKind) -> u64 {
        self.misses.with_label_values(&[tier.name()]).get()
    }

    /// Failures for a tier across all operations
    pub fn failures(&self, tier: TierKind) -> u64 {
        ["set", "get", "delete", "clear"]
            .iter()
            .map(|op| self.failures.with_label_values(&[tier.name(), op]).get())
            .sum()
    }

    pub fn refreshes(&self, outcome: RefreshOutcome) -> u64 {
        self.refreshes.with_label_values(&[outcome.label()]).get()
    }

    /// Render in Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {e}")))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.hits(TierKind::Memory),
            memory_misses: self.misses(TierKind::Memory),
            networked_hits: self.hits(TierKind::Networked),
            networked_misses: self.misses(TierKind::Networked),
            durable_hits: self.hits(TierKind::Durable),
            durable_misses: self.misses(TierKind::Durable),
            memory_failures: self.failures(TierKind::Memory),
            networked_failures: self.failures(TierKind::Networked),
            durable_failures: self.failures(TierKind::Durable),
            refreshes: self.refreshes(RefreshOutcome::Refreshed),
            refresh_failures: self.refreshes(RefreshOutcome::Failed),
            refreshes_cancelled: self.refreshes(RefreshOutcome::Cancelled),
            invalidations: self.invalidations.get(),
            codec_errors: self.codec_errors.get(),
            memory_entries: self.memory_entries.get().max(0) as u64,
            memory_evictions: self.memory_evictions.get().max(0) as u64,
        }
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {e}"))
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Point-in-time snapshot of metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub networked_hits: u64,
    pub networked_misses: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub memory_failures: u64,
    pub networked_failures: u64,
    pub durable_failures: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub refreshes_cancelled: u64,
    pub invalidations: u64,
    pub codec_errors: u64,
    pub memory_entries: u64,
    pub memory_evictions: u64,
}

impl MetricsSnapshot {
    /// Hits across every tier
    pub fn total_hits(&self) -> u64 {
        self.memory_hits + self.networked_hits + self.durable_hits
    }

    /// Fraction of reads answered by the memory tier
    pub fn memory_hit_ratio(&self) -> f64 {
        let total = self.memory_hits + self.memory_misses;
        if total == 0 {
            0.0
        } else {
            self.memory_hits as f64 / total as f64
        }
    }
}
