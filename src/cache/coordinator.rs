//! Cache Coordinator
//!
//! Owns the configured tiers together with the tag index, access optimizer,
//! refresh scheduler and metrics, and applies the fallthrough / fan-out
//! policy across them.

use std::future::Future;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::codec::{CacheValue, ValueCodec};
use super::compression::CompressionConfig;
use super::durable::{PostgresConfig, PostgresStore};
use super::entry::{validate_key, validate_ttl, TierKind, TierSet};
use super::memory::{MemoryConfig, MemoryStats, MemoryStore};
use super::metrics::{CacheMetrics, MetricsSnapshot, RefreshOutcome};
use super::networked::{RedisConfig, RedisStore};
use super::optimizer::AccessOptimizer;
use super::refresh::{refresh_delay, RefreshScheduler, RefreshTicket};
use super::store::{FanOutReport, TierStore};
use super::tags::TagIndex;
use super::{DEFAULT_ACCESS_TRACKING_CAPACITY, DEFAULT_TTL};
use crate::broadcast::{Broadcaster, InvalidationEvent, InvalidationHub};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Coordinator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Tiers to enable; order is irrelevant, reads always go fastest first
    pub tiers: Vec<TierKind>,
    /// TTL for writes without an explicit TTL or access history
    pub default_ttl_secs: u64,
    /// Copy lower-tier hits into the faster tiers.
    ///
    /// Tiers do not report the time left on an entry, so a promoted copy gets
    /// the access-based TTL and may outlive the copy it was read from.
    pub promote_on_read: bool,
    /// `clear` also forgets every tag association
    pub clear_purges_tags: bool,
    /// Keys whose access counts are tracked
    pub access_tracking_capacity: usize,
    pub memory: MemoryConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub compression: CompressionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tiers: vec![TierKind::Memory],
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            promote_on_read: false,
            clear_purges_tags: false,
            access_tracking_capacity: DEFAULT_ACCESS_TRACKING_CAPACITY,
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
            postgres: PostgresConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid cache configuration: {e}")))
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn tier_set(&self) -> TierSet {
        self.tiers.iter().copied().collect()
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 {
            return Err(Error::Config("default_ttl_secs must be positive".into()));
        }
        if self.access_tracking_capacity == 0 {
            return Err(Error::Config(
                "access_tracking_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-write options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Explicit TTL; when absent the optimizer or the default decides
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheCoordinator`]
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    default_ttl: Option<Duration>,
    stores: Vec<Arc<dyn TierStore>>,
    memory: Option<Arc<MemoryStore>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable exactly these tiers
    pub fn tiers(mut self, tiers: impl IntoIterator<Item = TierKind>) -> Self {
        self.config.tiers = tiers.into_iter().collect();
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn promote_on_read(mut self, enabled: bool) -> Self {
        self.config.promote_on_read = enabled;
        self
    }

    pub fn clear_purges_tags(mut self, enabled: bool) -> Self {
        self.config.clear_purges_tags = enabled;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Use a prepared memory store; its stats feed the metrics gauges
    pub fn memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.memory = Some(Arc::clone(&store));
        self.stores.push(store);
        self
    }

    /// Use `store` for its tier instead of building one from configuration.
    /// The tier is enabled even if the configuration omits it.
    pub fn store(mut self, store: Arc<dyn TierStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Where delete invalidations are published; defaults to a private hub
    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Connect every enabled tier and assemble the coordinator
    pub async fn build(self) -> Result<CacheCoordinator> {
        self.config.validate()?;
        let default_ttl = self.default_ttl.unwrap_or(self.config.default_ttl());
        validate_ttl(default_ttl)?;

        let tier_set = self
            .stores
            .iter()
            .fold(self.config.tier_set(), |set, store| set.with(store.kind()));
        if tier_set.is_empty() {
            return Err(Error::Config("at least one tier must be enabled".into()));
        }

        let mut memory = None;
        let mut tiers: Vec<Arc<dyn TierStore>> = Vec::with_capacity(tier_set.len());
        for kind in tier_set.iter() {
            if let Some(store) = self.stores.iter().rev().find(|s| s.kind() == kind) {
                if kind == TierKind::Memory {
                    memory = self.memory.clone();
                }
                tiers.push(Arc::clone(store));
                continue;
            }
            let store: Arc<dyn TierStore> = match kind {
                TierKind::Memory => {
                    let store = Arc::new(MemoryStore::with_config(&self.config.memory)?);
                    memory = Some(Arc::clone(&store));
                    store
                }
                TierKind::Networked => Arc::new(RedisStore::connect(&self.config.redis)?),
                TierKind::Durable => Arc::new(PostgresStore::connect(&self.config.postgres).await?),
            };
            tiers.push(store);
        }

        let tracking = NonZeroUsize::new(self.config.access_tracking_capacity)
            .ok_or_else(|| Error::Config("access_tracking_capacity must be at least 1".into()))?;

        info!(tiers = %tier_set, default_ttl_secs = default_ttl.as_secs(), "Cache coordinator ready");

        Ok(CacheCoordinator {
            inner: Arc::new(Inner {
                tiers,
                tier_set,
                memory,
                codec: ValueCodec::with_compression(self.config.compression.clone()),
                tags: TagIndex::new(),
                optimizer: AccessOptimizer::with_capacity(tracking),
                refresh: RefreshScheduler::new(),
                metrics: CacheMetrics::new()?,
                broadcaster: self
                    .broadcaster
                    .unwrap_or_else(|| Arc::new(InvalidationHub::new())),
                default_ttl,
                promote_on_read: self.config.promote_on_read,
                clear_purges_tags: self.config.clear_purges_tags,
            }),
        })
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct Inner {
    /// Fastest first
    tiers: Vec<Arc<dyn TierStore>>,
    tier_set: TierSet,
    memory: Option<Arc<MemoryStore>>,
    codec: ValueCodec,
    tags: TagIndex,
    optimizer: AccessOptimizer,
    refresh: RefreshScheduler,
    metrics: CacheMetrics,
    broadcaster: Arc<dyn Broadcaster>,
    default_ttl: Duration,
    promote_on_read: bool,
    clear_purges_tags: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.refresh.abort_all();
    }
}

/// Multi-tier cache handle; clones share the same state
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl CacheCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Build from configuration alone
    pub async fn connect(config: CoordinatorConfig) -> Result<Self> {
        Self::builder().config(config).build().await
    }

    /// Write `value` to every tier
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        opts: SetOptions,
    ) -> Result<FanOutReport> {
        validate_key(key)?;
        if let Some(ttl) = opts.ttl {
            validate_ttl(ttl)?;
        }
        let encoded = self.inner.codec.encode(&value.into())?;
        self.cancel_refresh(key).await;
        let ttl = self.effective_ttl(key, opts.ttl);
        Ok(self.write_encoded(key, encoded, ttl).await)
    }

    /// Read through the tiers fastest first; `Ok(None)` when no tier has it
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        validate_key(key)?;
        self.inner.optimizer.track_access(key);

        for (position, tier) in self.inner.tiers.iter().enumerate() {
            let kind = tier.kind();
            let raw = match tier.get(key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.inner.metrics.record_miss(kind);
                    continue;
                }
                Err(e) => {
                    warn!(tier = %kind, key = %key, error = %e, "tier read failed, falling through");
                    self.inner.metrics.record_failure(kind, "get");
                    self.inner.metrics.record_miss(kind);
                    continue;
                }
            };

            self.inner.metrics.record_hit(kind);
            let value = self.inner.codec.decode(&raw).inspect_err(|e| {
                warn!(tier = %kind, key = %key, error = %e, "stored value failed to decode");
                self.inner.metrics.record_codec_error();
            })?;

            if self.inner.promote_on_read && position > 0 {
                self.promote(key, raw, position).await;
            }
            return Ok(Some(value));
        }

        debug!(key = %key, "cache miss on every tier");
        Ok(None)
    }

    /// Remove `key` from every tier and publish an invalidation
    pub async fn delete(&self, key: &str) -> Result<FanOutReport> {
        validate_key(key)?;
        self.cancel_refresh(key).await;

        let results = join_all(
            self.inner
                .tiers
                .iter()
                .map(|tier| async move { (tier.kind(), tier.delete(key).await) }),
        )
        .await;
        let report = self.collect("delete", key, results);

        self.inner.tags.remove_key(key);
        self.notify(key).await;
        Ok(report)
    }

    /// Empty every tier and cancel every pending refresh
    #[instrument(skip(self))]
    pub async fn clear(&self) -> FanOutReport {
        let cancelled = self.inner.refresh.cancel_all().await;
        for _ in 0..cancelled {
            self.inner.metrics.record_refresh(RefreshOutcome::Cancelled);
        }

        let results = join_all(
            self.inner
                .tiers
                .iter()
                .map(|tier| async move { (tier.kind(), tier.clear().await) }),
        )
        .await;
        let report = self.collect("clear", "*", results);

        if self.inner.clear_purges_tags {
            self.inner.tags.purge();
        }
        self.sync_memory_stats();
        info!(cancelled_refreshes = cancelled, failed = report.failures().len(), "cache cleared");
        report
    }

    /// `set` each entry in order; reports are merged
    pub async fn set_many<I, K, V>(&self, entries: I, opts: SetOptions) -> Result<FanOutReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<CacheValue>,
    {
        let entries: Vec<(K, V)> = entries.into_iter().collect();
        for (key, _) in &entries {
            validate_key(key.as_ref())?;
        }

        let mut report = FanOutReport::new();
        for (key, value) in entries {
            report.merge(self.set(key.as_ref(), value, opts).await?);
        }
        Ok(report)
    }

    /// `get` each key in order; every requested key gets an entry
    pub async fn get_many<I, K>(&self, keys: I) -> Result<Vec<(String, Option<CacheValue>)>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut found = Vec::new();
        for key in keys {
            let key = key.as_ref();
            found.push((key.to_string(), self.get(key).await?));
        }
        Ok(found)
    }

    /// `delete` each key in order; reports are merged
    pub async fn delete_many<I, K>(&self, keys: I) -> Result<FanOutReport>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        for key in &keys {
            validate_key(key.as_ref())?;
        }

        let mut report = FanOutReport::new();
        for key in &keys {
            report.merge(self.delete(key.as_ref()).await?);
        }
        Ok(report)
    }

    /// `set`, then record the key under every tag
    pub async fn set_with_tag<I, S>(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        tags: I,
        opts: SetOptions,
    ) -> Result<FanOutReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: Vec<S> = tags.into_iter().collect();
        for tag in &tags {
            validate_tag(tag.as_ref())?;
        }

        let report = self.set(key, value, opts).await?;
        self.inner.tags.tag(key, &tags);
        Ok(report)
    }

    /// Delete every key recorded under `tag`; unknown tags are a no-op
    #[instrument(skip(self))]
    pub async fn delete_by_tag(&self, tag: &str) -> Result<FanOutReport> {
        validate_tag(tag)?;
        let keys = self.inner.tags.keys_for(tag);
        if keys.is_empty() {
            return Ok(FanOutReport::new());
        }

        let report = self.delete_many(&keys).await?;
        self.inner.tags.remove_tag(tag);
        info!(tag = %tag, keys = keys.len(), "tag invalidated");
        Ok(report)
    }

    /// `set`, then schedule one refresh at 90% of `ttl`.
    ///
    /// When it fires, `producer` supplies the new value, which is written with
    /// the same TTL. Deleting the key, clearing the cache or setting the key
    /// again before then cancels the refresh. Producer errors are logged and
    /// counted, never retried.
    pub async fn set_with_auto_refresh<V, F, Fut, T, E>(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        producer: F,
    ) -> Result<FanOutReport>
    where
        V: Into<CacheValue>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Into<CacheValue> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        validate_key(key)?;
        validate_ttl(ttl)?;
        let encoded = self.inner.codec.encode(&value.into())?;

        // registered before writing so a concurrent delete cancels it
        self.cancel_refresh(key).await;
        let ticket = self.inner.refresh.register(key).await;
        let report = self.write_encoded(key, encoded, ttl).await;

        let delay = refresh_delay(ttl);
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "auto-refresh scheduled");
        tokio::spawn(run_refresh(
            Arc::downgrade(&self.inner),
            ticket,
            ttl,
            delay,
            producer,
        ));
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Typed wrappers
    // -------------------------------------------------------------------------

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        opts: SetOptions,
    ) -> Result<FanOutReport> {
        self.set(key, CacheValue::json(value)?, opts).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key).await?.map(CacheValue::into_json).transpose()
    }

    pub async fn set_buffer(
        &self,
        key: &str,
        data: impl AsRef<[u8]>,
        opts: SetOptions,
    ) -> Result<FanOutReport> {
        self.set(key, data.as_ref(), opts).await
    }

    pub async fn get_buffer(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get(key).await?.map(CacheValue::into_binary).transpose()
    }

    pub async fn set_text(
        &self,
        key: &str,
        text: impl Into<String>,
        opts: SetOptions,
    ) -> Result<FanOutReport> {
        self.set(key, text.into(), opts).await
    }

    pub async fn get_text(&self, key: &str) -> Result<Option<String>> {
        self.get(key).await?.map(CacheValue::into_text).transpose()
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        self.sync_memory_stats();
        self.inner.metrics.snapshot()
    }

    /// Metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String> {
        self.sync_memory_stats();
        self.inner.metrics.encode()
    }

    pub fn memory_stats(&self) -> Option<MemoryStats> {
        self.inner.memory.as_ref().map(|m| m.stats())
    }

    pub fn tiers(&self) -> TierSet {
        self.inner.tier_set
    }

    pub fn tags_for(&self, key: &str) -> Vec<String> {
        self.inner.tags.tags_for(key)
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.inner.tags.keys_for(tag)
    }

    pub fn is_refresh_pending(&self, key: &str) -> bool {
        self.inner.refresh.is_pending(key)
    }

    pub fn pending_refreshes(&self) -> usize {
        self.inner.refresh.pending_count()
    }

    /// Ping every tier; unhealthy tiers show up as failures
    pub async fn ping(&self) -> FanOutReport {
        let results = join_all(
            self.inner
                .tiers
                .iter()
                .map(|tier| async move { (tier.kind(), tier.ping().await) }),
        )
        .await;
        self.collect("ping", "*", results)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn effective_ttl(&self, key: &str, explicit: Option<Duration>) -> Duration {
        explicit.unwrap_or_else(|| {
            if self.inner.optimizer.access_count(key) > 0 {
                self.inner.optimizer.recommended_ttl(key)
            } else {
                self.inner.default_ttl
            }
        })
    }

    /// Returns once any refresh write already under way has landed
    async fn cancel_refresh(&self, key: &str) {
        if self.inner.refresh.cancel(key).await {
            debug!(key = %key, "pending refresh cancelled");
            self.inner.metrics.record_refresh(RefreshOutcome::Cancelled);
        }
    }

    async fn write_encoded(&self, key: &str, encoded: Bytes, ttl: Duration) -> FanOutReport {
        let encoded = &encoded;
        let results = join_all(
            self.inner
                .tiers
                .iter()
                .map(|tier| async move { (tier.kind(), tier.set(key, encoded.clone(), ttl).await) }),
        )
        .await;
        let report = self.collect("set", key, results);
        self.sync_memory_stats();
        report
    }

    /// Copy a hit found at `position` into every faster tier, with the
    /// access-based TTL
    async fn promote(&self, key: &str, raw: Bytes, position: usize) {
        let ttl = self.inner.optimizer.recommended_ttl(key);
        let raw = &raw;
        let results = join_all(
            self.inner.tiers[..position]
                .iter()
                .map(|tier| async move { (tier.kind(), tier.set(key, raw.clone(), ttl).await) }),
        )
        .await;
        let report = self.collect("set", key, results);
        debug!(key = %key, promoted_to = report.succeeded().len(), "value promoted");
    }

    fn collect(&self, op: &'static str, key: &str, results: Vec<(TierKind, Result<()>)>) -> FanOutReport {
        let mut report = FanOutReport::new();
        for (tier, result) in results {
            match result {
                Ok(()) => report.record_success(tier),
                Err(e) => {
                    warn!(tier = %tier, op, key = %key, error = %e, "tier operation failed");
                    self.inner.metrics.record_failure(tier, op);
                    report.record_failure(tier, &e);
                }
            }
        }
        report
    }

    async fn notify(&self, key: &str) {
        match self
            .inner
            .broadcaster
            .publish(InvalidationEvent::invalidate(key))
            .await
        {
            Ok(delivered) => {
                self.inner.metrics.record_invalidation();
                debug!(key = %key, delivered, "invalidation published");
            }
            Err(e) => warn!(key = %key, error = %e, "invalidation publish failed"),
        }
    }

    fn sync_memory_stats(&self) {
        if let Some(memory) = &self.inner.memory {
            self.inner.metrics.update_memory_stats(&memory.stats());
        }
    }
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("tiers", &self.inner.tier_set)
            .field("default_ttl", &self.inner.default_ttl)
            .field("pending_refreshes", &self.inner.refresh.pending_count())
            .finish()
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::Validation("tag must not be empty".into()));
    }
    Ok(())
}

async fn run_refresh<F, Fut, T, E>(
    inner: Weak<Inner>,
    ticket: RefreshTicket,
    ttl: Duration,
    delay: Duration,
    producer: F,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Into<CacheValue> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::select! {
        _ = ticket.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let produced = producer().await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let coordinator = CacheCoordinator { inner };

    // a delete, clear or newer set while the producer ran wins
    let Some(claim) = coordinator.inner.refresh.claim(&ticket).await else {
        debug!(key = %ticket.key(), "refresh superseded, value dropped");
        return;
    };

    let encoded = match produced {
        Ok(value) => coordinator.inner.codec.encode(&value.into()),
        Err(e) => {
            warn!(key = %ticket.key(), error = %e, "refresh producer failed");
            coordinator.inner.refresh.finish(&ticket, claim);
            coordinator.inner.metrics.record_refresh(RefreshOutcome::Failed);
            return;
        }
    };

    match encoded {
        Ok(encoded) => {
            // held across the write; a delete arriving now waits, then removes it
            let report = coordinator.write_encoded(ticket.key(), encoded, ttl).await;
            coordinator.inner.refresh.finish(&ticket, claim);
            coordinator.inner.metrics.record_refresh(RefreshOutcome::Refreshed);
            debug!(key = %ticket.key(), failed = report.failures().len(), "key refreshed");
        }
        Err(e) => {
            warn!(key = %ticket.key(), error = %e, "refreshed value failed to encode");
            coordinator.inner.refresh.finish(&ticket, claim);
            coordinator.inner.metrics.record_refresh(RefreshOutcome::Failed);
        }
    }
}
