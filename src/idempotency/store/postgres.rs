use super::{IdempotencyStore, StoreBackend};
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{expiry_from, IdempotencyRecord, IdempotencyState};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Row shape of `idempotency_claims`.
#[derive(Debug, sqlx::FromRow)]
struct ClaimRow {
    key: String,
    state: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<ClaimRow> for IdempotencyRecord {
    type Error = AppError;

    fn try_from(row: ClaimRow) -> Result<Self> {
        Ok(IdempotencyRecord {
            key: row.key,
            state: row.state.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

/// PostgreSQL-based claim storage.
///
/// The primary key on the canonical key string is the atomicity primitive:
/// a unique violation on INSERT means somebody else holds a live claim.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Counts live records in the given state.
    pub async fn count_by_state(&self, state: IdempotencyState) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_claims
            WHERE state = $1 AND expires_at > $2
            "#,
        )
        .bind(state.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }

    fn observe(&self, operation: &str, timer: &LatencyTimer, success: bool) {
        get_metrics().record_store_operation(
            StoreBackend::Postgres.as_str(),
            operation,
            timer.elapsed_ms(),
            success,
        );
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool> {
        let timer = LatencyTimer::new();
        let now = Utc::now();
        let record = IdempotencyRecord::pending(key.canonical(), ttl_seconds, now);

        let result = async {
            let mut tx = self.pool.begin().await?;

            // An expired row for this key must not block the insert.
            let swept = sqlx::query(
                "DELETE FROM idempotency_claims WHERE key = $1 AND expires_at <= $2",
            )
            .bind(&record.key)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if swept > 0 {
                tracing::debug!(key = %key.redacted(), "Replaced expired idempotency claim");
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_claims (key, state, created_at, expires_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&record.key)
            .bind(record.state.as_str())
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await?;
                    Ok::<_, sqlx::Error>(true)
                }
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await?;
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        }
        .await;

        self.observe("claim", &timer, result.is_ok());
        match result {
            Ok(claimed) => {
                tracing::debug!(key = %key.redacted(), claimed, ttl_seconds, "Postgres claim");
                Ok(claimed)
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT key, state, created_at, expires_at
            FROM idempotency_claims
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key.canonical())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await;

        self.observe("get", &timer, row.is_ok());
        row.map_err(AppError::Database)?
            .map(IdempotencyRecord::try_from)
            .transpose()
    }

    async fn set_state(&self, key: &IdempotencyKey, state: IdempotencyState) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                r#"
                UPDATE idempotency_claims
                SET state = $2
                WHERE key = $1 AND expires_at > $3
                "#,
            )
            .bind(key.canonical())
            .bind(state.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(updated)
        }
        .await;

        self.observe("set_state", &timer, result.is_ok());
        let updated = result.map_err(AppError::Database)?;
        tracing::debug!(key = %key.redacted(), state = %state, updated, "Postgres state update");
        Ok(())
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = async {
            let mut tx = self.pool.begin().await?;
            let deleted = sqlx::query("DELETE FROM idempotency_claims WHERE key = $1")
                .bind(key.canonical())
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(deleted)
        }
        .await;

        self.observe("release", &timer, result.is_ok());
        let deleted = result.map_err(AppError::Database)?;
        tracing::debug!(key = %key.redacted(), deleted, "Postgres claim released");
        Ok(())
    }

    async fn extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<()> {
        let timer = LatencyTimer::new();
        let now = Utc::now();
        let result = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                r#"
                UPDATE idempotency_claims
                SET expires_at = $2
                WHERE key = $1 AND expires_at > $3
                "#,
            )
            .bind(key.canonical())
            .bind(expiry_from(now, ttl_seconds))
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(updated)
        }
        .await;

        self.observe("extend", &timer, result.is_ok());
        let updated = result.map_err(AppError::Database)?;
        tracing::debug!(key = %key.redacted(), ttl_seconds, updated, "Postgres claim extended");
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let timer = LatencyTimer::new();
        let result = sqlx::query("DELETE FROM idempotency_claims WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

        self.observe("purge_expired", &timer, result.is_ok());
        Ok(result.map_err(AppError::Database)?.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }
}
