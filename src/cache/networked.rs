//! Networked Tier - Redis
//!
//! Shared cache reachable by every instance. Values are stored with a
//! millisecond TTL (`PSETEX`). When a key prefix is configured every key is
//! namespaced and `clear` only removes keys under that prefix; without a
//! prefix the store owns the whole logical database and `clear` is
//! `FLUSHDB`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::entry::{validate_ttl, TierKind};
use super::store::TierStore;
use crate::error::{Error, Result};

/// Keys deleted per `DEL` while clearing a prefix
const CLEAR_BATCH: usize = 500;

/// Redis tier configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
    /// Maximum pooled connections
    pub pool_size: usize,
    /// Pool wait/create/recycle timeout in milliseconds
    pub timeout_ms: u64,
    /// Namespace prepended to every key
    pub key_prefix: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            timeout_ms: 2_000,
            key_prefix: None,
        }
    }
}

/// Redis-backed tier
pub struct RedisStore {
    pool: Pool,
    key_prefix: Option<String>,
}

impl RedisStore {
    /// Build a pool from configuration. Connections are established lazily,
    /// so an unreachable server surfaces on first use, not here.
    #[instrument(skip(config), fields(url = %config.url))]
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        info!(pool_size = config.pool_size, "Creating Redis connection pool");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let timeout = Some(Duration::from_millis(config.timeout_ms));
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = timeout;
        pool_config.timeouts.create = timeout;
        pool_config.timeouts.recycle = timeout;
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("invalid Redis configuration: {e}")))?;

        Ok(Self::with_pool(pool, config.key_prefix.clone()))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Pool, key_prefix: Option<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.filter(|p| !p.is_empty()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced_key(self.key_prefix.as_deref(), key)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::tier(TierKind::Networked, format!("connection error: {e}")))
    }
}

fn namespaced_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{key}"),
        None => key.to_string(),
    }
}

/// `SCAN MATCH` pattern covering every key under `prefix`, with glob
/// metacharacters in the prefix escaped
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn millis(ttl: Duration) -> u64 {
    // PSETEX rejects 0; a sub-millisecond TTL rounds up
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(op: &str, e: redis::RedisError) -> Error {
    Error::tier(TierKind::Networked, format!("{op} failed: {e}"))
}

#[async_trait]
impl TierStore for RedisStore {
    fn kind(&self) -> TierKind {
        TierKind::Networked
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        validate_ttl(ttl)?;
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(self.namespaced(key), value.as_ref(), millis(ttl))
            .await
            .map_err(|e| command_error("PSETEX", e))?;
        debug!(key = %key, ttl_ms = millis(ttl), "networked tier set");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn().await?;
        let data: Option<Vec<u8>> = conn
            .get(self.namespaced(key))
            .await
            .map_err(|e| command_error("GET", e))?;
        Ok(data.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.namespaced(key))
            .await
            .map_err(|e| command_error("DEL", e))
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn().await?;

        let Some(prefix) = self.key_prefix.as_deref() else {
            let _: () = redis::cmd("FLUSHDB")
                .query_async(&mut *conn)
                .await
                .map_err(|e| command_error("FLUSHDB", e))?;
            info!("networked tier flushed");
            return Ok(());
        };

        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(prefix_pattern(prefix))
                .await
                .map_err(|e| command_error("SCAN", e))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        for batch in keys.chunks(CLEAR_BATCH) {
            conn.del::<_, ()>(batch)
                .await
                .map_err(|e| command_error("DEL", e))?;
        }
        info!(prefix = %prefix, removed = keys.len(), "networked tier cleared");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("PING", e))?;
        Ok(())
    }
}
