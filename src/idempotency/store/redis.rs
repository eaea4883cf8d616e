use super::{IdempotencyStore, StoreBackend};
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyState};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

pub const DEFAULT_KEY_PREFIX: &str = "idempotent:";
const STATE_SUFFIX: &str = ":state";

/// Redis-based claim storage.
///
/// Each claim is a `SET NX EX` entry holding its creation time in epoch
/// millis, plus an auxiliary `:state` entry under the same TTL. Redis expiry
/// replaces the sweep.
#[derive(Debug, Clone)]
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn with_default_prefix(client: redis::Client) -> Self {
        Self::new(client, DEFAULT_KEY_PREFIX)
    }

    fn claim_key(&self, key: &IdempotencyKey) -> String {
        format!("{}{}", self.key_prefix, key.canonical())
    }

    fn state_key(&self, key: &IdempotencyKey) -> String {
        format!("{}{}{}", self.key_prefix, key.canonical(), STATE_SUFFIX)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    fn observe(&self, operation: &str, timer: &LatencyTimer, success: bool) {
        get_metrics().record_store_operation(
            StoreBackend::Redis.as_str(),
            operation,
            timer.elapsed_ms(),
            success,
        );
    }

    async fn try_claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.connection().await?;
        let claim_key = self.claim_key(key);

        let created: Option<String> = conn
            .set_options(
                &claim_key,
                Utc::now().timestamp_millis(),
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl_seconds as usize)),
            )
            .await
            .map_err(AppError::Redis)?;

        if created.is_none() {
            return Ok(false);
        }

        // The claim itself is already won; a missing state entry reads as PENDING.
        if let Err(e) = conn
            .set_ex::<_, _, ()>(
                self.state_key(key),
                IdempotencyState::Pending.as_str(),
                ttl_seconds,
            )
            .await
        {
            tracing::warn!(key = %key.redacted(), error = %e, "Failed to write idempotency state entry");
        }

        Ok(true)
    }

    async fn try_get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;

        let (created_millis, state, pttl): (Option<i64>, Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(self.claim_key(key))
            .cmd("GET")
            .arg(self.state_key(key))
            .cmd("PTTL")
            .arg(self.claim_key(key))
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        // PTTL is -2 for a missing key and -1 for a key without expiry.
        let Some(created_millis) = created_millis else {
            return Ok(None);
        };
        if pttl <= 0 {
            return Ok(None);
        }

        let now = Utc::now();
        let state = match state.as_deref() {
            None => IdempotencyState::Pending,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key = %key.redacted(), state = raw, "Invalid idempotency state entry");
                IdempotencyState::Pending
            }),
        };

        Ok(Some(IdempotencyRecord {
            key: key.canonical().to_string(),
            state,
            created_at: Utc
                .timestamp_millis_opt(created_millis)
                .single()
                .unwrap_or(now),
            expires_at: now + Duration::milliseconds(pttl),
        }))
    }

    async fn try_set_state(&self, key: &IdempotencyKey, state: IdempotencyState) -> Result<bool> {
        let mut conn = self.connection().await?;

        let pttl: i64 = conn
            .pttl(self.claim_key(key))
            .await
            .map_err(AppError::Redis)?;
        if pttl <= 0 {
            return Ok(false);
        }

        let _: () = redis::cmd("SET")
            .arg(self.state_key(key))
            .arg(state.as_str())
            .arg("PX")
            .arg(pttl)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(true)
    }

    async fn try_release(&self, key: &IdempotencyKey) -> Result<i64> {
        let mut conn = self.connection().await?;
        conn.del(vec![self.claim_key(key), self.state_key(key)])
            .await
            .map_err(AppError::Redis)
    }

    async fn try_extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.connection().await?;

        let (claim_extended, _state_extended): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("EXPIRE")
            .arg(self.claim_key(key))
            .arg(ttl_seconds)
            .cmd("EXPIRE")
            .arg(self.state_key(key))
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(claim_extended == 1)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = self.try_claim(key, ttl_seconds).await;
        self.observe("claim", &timer, result.is_ok());

        if let Ok(claimed) = result {
            tracing::debug!(key = %key.redacted(), claimed, ttl_seconds, "Redis claim");
        }
        result
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let result = self.try_get(key).await;
        self.observe("get", &timer, result.is_ok());
        result
    }

    async fn set_state(&self, key: &IdempotencyKey, state: IdempotencyState) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.try_set_state(key, state).await;
        self.observe("set_state", &timer, result.is_ok());

        if !result? {
            tracing::debug!(key = %key.redacted(), state = %state, "Claim already expired, state not updated");
        }
        Ok(())
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.try_release(key).await;
        self.observe("release", &timer, result.is_ok());

        let deleted = result?;
        tracing::debug!(key = %key.redacted(), deleted, "Redis claim released");
        Ok(())
    }

    async fn extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.try_extend(key, ttl_seconds).await;
        self.observe("extend", &timer, result.is_ok());

        let extended = result?;
        tracing::debug!(key = %key.redacted(), ttl_seconds, extended, "Redis claim extended");
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }
}
