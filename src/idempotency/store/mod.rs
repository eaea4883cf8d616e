//! Atomic claim storage behind a single trait, with in-process, PostgreSQL
//! and Redis implementations.

pub mod memory;
pub mod postgres;
pub mod redis;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use self::memory::MemoryIdempotencyStore;
pub use self::postgres::PostgresIdempotencyStore;
pub use self::redis::RedisIdempotencyStore;

/// Which storage backend holds the claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres => "postgres",
            StoreBackend::Redis => "redis",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "database" | "relational" => Ok(StoreBackend::Postgres),
            "redis" | "cache" => Ok(StoreBackend::Redis),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "Unknown idempotency store backend: {}",
                other
            ))),
        }
    }
}

/// Storage contract for idempotency claims.
///
/// Every read treats a record past `expires_at` as absent, whether or not it
/// has been physically removed. `claim` is the one operation concurrent
/// callers race on and must be a single atomic step: `Ok(true)` means this
/// call created the PENDING record, `Ok(false)` means a live record already
/// existed. A backend fault is an `Err`, never `Ok(false)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically creates a PENDING record iff no live one exists.
    async fn claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool>;

    /// Returns the live record, if any.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    /// Updates the state of a live record; no-op when there is none.
    async fn set_state(&self, key: &IdempotencyKey, state: IdempotencyState) -> Result<()>;

    /// Deletes the record so the key can be claimed again immediately.
    async fn release(&self, key: &IdempotencyKey) -> Result<()>;

    /// Resets `expires_at` to now + `ttl_seconds`; no-op when there is no live record.
    async fn extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<()>;

    /// Physically removes expired records and returns how many went.
    async fn purge_expired(&self) -> Result<u64>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> StoreBackend;
}

/// Builds the backend selected in the settings.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn IdempotencyStore>> {
    let backend = settings.idempotency.backend;
    tracing::info!(backend = %backend, "Connecting idempotency store");

    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryIdempotencyStore::new())),
        StoreBackend::Postgres => {
            let database = settings.database.as_ref().ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "database settings are required for the postgres backend"
                ))
            })?;
            let pool = PgPoolOptions::new()
                .max_connections(database.pool_size)
                .acquire_timeout(Duration::from_secs(database.acquire_timeout_seconds))
                .connect(&database.url)
                .await?;
            let store = PostgresIdempotencyStore::new(pool);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => {
            let redis = settings.redis.as_ref().ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "redis settings are required for the redis backend"
                ))
            })?;
            let client = ::redis::Client::open(redis.url.as_str())?;
            let store =
                RedisIdempotencyStore::new(client, settings.idempotency.key_prefix.clone());
            store.ping().await?;
            Ok(Arc::new(store))
        }
    }
}
