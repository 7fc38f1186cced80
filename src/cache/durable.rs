//! Durable Tier - PostgreSQL
//!
//! Slowest tier and the only one that survives restarts of both the process
//! and the networked cache. One row per key; writes are upserts. Expiry is
//! evaluated by the database clock so every instance agrees on it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use sqlx_core::pool::PoolOptions;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use super::entry::{validate_ttl, TierKind};
use super::store::TierStore;
use crate::error::{Error, Result};

/// Type alias for PostgreSQL pool options.
pub type PgPoolOptions = PoolOptions<Postgres>;

/// PostgreSQL tier configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection URL
    pub url: String,
    /// Maximum pooled connections
    pub pool_size: u32,
    /// Acquire timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Table holding cache rows, optionally schema-qualified
    pub table: String,
    /// Create the table on startup if it is missing
    pub create_table: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/tiercache".to_string(),
            pool_size: 8,
            connect_timeout_ms: 5_000,
            table: "cache_entries".to_string(),
            create_table: true,
        }
    }
}

/// SQL statements for one table, built once
#[derive(Debug, Clone)]
struct Statements {
    create_table: String,
    create_index: String,
    upsert: String,
    select: String,
    delete: String,
    clear: String,
    purge_expired: String,
}

impl Statements {
    fn for_table(table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let index_base = table.rsplit('.').next().unwrap_or(table);
        Ok(Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 key TEXT PRIMARY KEY, \
                 value BYTEA NOT NULL, \
                 expires_at TIMESTAMPTZ)"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {index_base}_expires_at_idx ON {table} (expires_at)"
            ),
            upsert: format!(
                "INSERT INTO {table} (key, value, expires_at) \
                 VALUES ($1, $2, NOW() + $3::bigint * INTERVAL '1 millisecond') \
                 ON CONFLICT (key) DO UPDATE \
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at"
            ),
            select: format!(
                "SELECT value, (expires_at IS NOT NULL AND expires_at <= NOW()) AS expired \
                 FROM {table} WHERE key = $1"
            ),
            delete: format!("DELETE FROM {table} WHERE key = $1"),
            clear: format!("DELETE FROM {table}"),
            purge_expired: format!("DELETE FROM {table} WHERE expires_at <= NOW()"),
        })
    }
}

/// Accept `name` or `schema.name`, each part a plain SQL identifier
fn validate_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        part.len() <= 63
            && chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(Error::Config(format!("invalid table name: {table:?}")));
    }
    Ok(())
}

fn db_error(op: &str, e: sqlx_core::Error) -> Error {
    Error::tier(TierKind::Durable, format!("{op} failed: {e}"))
}

/// PostgreSQL-backed tier
pub struct PostgresStore {
    pool: PgPool,
    sql: Statements,
}

impl PostgresStore {
    /// Create a pool and, if configured, the cache table
    #[instrument(skip(config), fields(table = %config.table))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let sql = Statements::for_table(&config.table)?;
        info!(pool_size = config.pool_size, "Creating PostgreSQL connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(|e| db_error("connect", e))?;

        let store = Self { pool, sql };
        if config.create_table {
            store.ensure_schema().await?;
        }
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self> {
        Ok(Self {
            pool,
            sql: Statements::for_table(table)?,
        })
    }

    /// Create the table and expiry index if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        query(&self.sql.create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("create table", e))?;
        query(&self.sql.create_index)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("create index", e))?;
        debug!("durable tier schema ready");
        Ok(())
    }

    /// Delete every expired row; returns how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let done = query(&self.sql.purge_expired)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("purge", e))?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl TierStore for PostgresStore {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        validate_ttl(ttl)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        query(&self.sql.upsert)
            .bind(key)
            .bind(value.as_ref())
            .bind(ttl_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("upsert", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let row = query(&self.sql.select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("select", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expired: bool = row.try_get("expired").map_err(|e| db_error("decode", e))?;
        if expired {
            self.delete(key).await?;
            return Ok(None);
        }

        let value: Vec<u8> = row.try_get("value").map_err(|e| db_error("decode", e))?;
        Ok(Some(Bytes::from(value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        query(&self.sql.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete", e))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let done = query(&self.sql.clear)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("clear", e))?;
        info!(removed = done.rows_affected(), "durable tier cleared");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("ping", e))?;
        Ok(())
    }
}
