use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyState};
use crate::idempotency::store::IdempotencyStore;
use crate::idempotency::strategy::{IdempotencyStrategy, MAX_TTL_SECONDS};
use crate::observability::{get_metrics, LatencyTimer};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counters for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub invalid_requests: AtomicU64,
    pub claimed_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claimed(&self) {
        self.claimed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_rate(&self) -> f64 {
        self.snapshot().duplicate_rate()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            invalid_requests: self.invalid_requests.load(Ordering::Relaxed),
            claimed_requests: self.claimed_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests that reached the store; invalid ones are counted apart.
    pub total_requests: u64,
    pub invalid_requests: u64,
    pub claimed_requests: u64,
    pub duplicate_requests: u64,
    pub bypassed_requests: u64,
    pub rejected_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }
}

/// What happened to one `execute` call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// This caller won the claim and the work ran.
    Executed(T),
    /// The store was unreachable and the strategy fails open: the work ran
    /// without a claim, so a concurrent duplicate may also have run.
    Bypassed(T),
    /// A live claim already existed; the work was not invoked. Carries the
    /// existing record's state when it could be read.
    Duplicate(Option<IdempotencyState>),
}

impl<T> Outcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Outcome::Duplicate(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Executed(value) | Outcome::Bypassed(value) => Some(value),
            Outcome::Duplicate(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Executed(value) | Outcome::Bypassed(value) => Some(value),
            Outcome::Duplicate(_) => None,
        }
    }
}

/// Failure of an `execute` call. `E` is the protected work's own error type.
#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    /// Rejected before any storage call.
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("invalid idempotency strategy: {0}")]
    InvalidStrategy(String),

    /// The store could not be reached and the strategy fails closed; the
    /// work was not invoked.
    #[error("idempotency store unavailable: {0}")]
    Unavailable(#[source] AppError),

    /// The work itself failed; its claim has been released.
    #[error("protected work failed: {0}")]
    Work(E),
}

impl<E> IdempotencyError<E> {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IdempotencyError::Unavailable(_))
    }

    /// The work's original error, if that is what failed.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            IdempotencyError::Work(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<AppError> for IdempotencyError<E> {
    fn from(err: AppError) -> Self {
        match err {
            AppError::InvalidKey(message) => IdempotencyError::InvalidKey(message),
            AppError::InvalidStrategy(message) => IdempotencyError::InvalidStrategy(message),
            other => IdempotencyError::Unavailable(other),
        }
    }
}

/// Claim, run, record.
///
/// Holds no per-call state, so one engine can be cloned into every handler.
#[derive(Clone)]
pub struct IdempotencyEngine {
    store: Arc<dyn IdempotencyStore>,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyEngine {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Gets the metrics for this engine.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Counts a request rejected before any storage call and converts the
    /// error.
    pub(crate) fn reject_invalid<E>(&self, namespace: &str, err: AppError) -> IdempotencyError<E> {
        self.metrics.record_invalid();
        get_metrics().record_claim(self.store.backend().as_str(), namespace, "invalid");
        tracing::debug!(error = %err, "Idempotency request rejected");
        IdempotencyError::from(err)
    }

    /// Runs `work` at most once per live claim on `key`.
    ///
    /// A duplicate is `Ok(Outcome::Duplicate)`, not an error. When `work`
    /// fails or panics the claim is deleted so the caller can retry with the
    /// same key; a panic is resumed after the release. The engine itself
    /// never retries.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        strategy: &IdempotencyStrategy,
        work: F,
    ) -> std::result::Result<Outcome<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Err(e) = strategy.ensure_valid() {
            return Err(self.reject_invalid(key.namespace(), e));
        }
        self.metrics.record_request();

        let backend = self.store.backend();
        let namespace = key.namespace();

        match self.store.claim(key, strategy.ttl_seconds).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.record_duplicate();
                get_metrics().record_claim(backend.as_str(), namespace, "duplicate");

                let state = match self.store.get(key).await {
                    Ok(record) => record.map(|r| r.state),
                    Err(e) => {
                        tracing::debug!(key = %key.redacted(), error = %e, "Could not read state of duplicate claim");
                        None
                    }
                };
                tracing::info!(key = %key.redacted(), state = ?state, "Duplicate request, work skipped");
                return Ok(Outcome::Duplicate(state));
            }
            Err(e) if strategy.fail_open => {
                self.metrics.record_bypassed();
                get_metrics().record_claim(backend.as_str(), namespace, "bypassed");
                tracing::warn!(
                    key = %key.redacted(),
                    backend = %backend,
                    error = %e,
                    "Idempotency store unavailable, failing open: running work without a claim"
                );

                return match work().await {
                    Ok(value) => {
                        self.metrics.record_completed();
                        Ok(Outcome::Bypassed(value))
                    }
                    Err(e) => {
                        self.metrics.record_failed();
                        Err(IdempotencyError::Work(e))
                    }
                };
            }
            Err(e) => {
                self.metrics.record_rejected();
                get_metrics().record_claim(backend.as_str(), namespace, "rejected");
                tracing::error!(
                    key = %key.redacted(),
                    backend = %backend,
                    error = %e,
                    "Idempotency store unavailable, failing closed"
                );
                return Err(IdempotencyError::Unavailable(e));
            }
        }

        self.metrics.record_claimed();
        get_metrics().record_claim(backend.as_str(), namespace, "claimed");

        let timer = LatencyTimer::new();
        let result = match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                if let Err(release_err) = self.store.release(key).await {
                    tracing::error!(
                        "Failed to release idempotency key after work panicked: {}",
                        release_err
                    );
                }
                self.metrics.record_failed();
                get_metrics().record_work_failed(backend.as_str(), namespace);
                tracing::error!(key = %key.redacted(), "Work panicked, claim released");
                std::panic::resume_unwind(panic);
            }
        };

        match result {
            Ok(value) => {
                if let Err(e) = self.store.set_state(key, IdempotencyState::Success).await {
                    tracing::error!("Failed to mark idempotency key as succeeded: {}", e);
                }
                self.metrics.record_completed();
                get_metrics().record_work_completed(backend.as_str(), namespace, timer.elapsed_ms());
                Ok(Outcome::Executed(value))
            }
            Err(e) => {
                if let Err(release_err) = self.store.release(key).await {
                    tracing::error!(
                        "Failed to release idempotency key after work failure: {}",
                        release_err
                    );
                }
                self.metrics.record_failed();
                get_metrics().record_work_failed(backend.as_str(), namespace);
                tracing::debug!(key = %key.redacted(), "Work failed, claim released for retry");
                Err(IdempotencyError::Work(e))
            }
        }
    }

    /// Current live record for `key`, if any.
    pub async fn inspect(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.store.get(key).await
    }

    /// Drops the claim on `key` so it can be claimed again immediately.
    pub async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        self.store.release(key).await
    }

    /// Keeps a long-running claim alive for another `ttl_seconds`.
    pub async fn extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<()> {
        if ttl_seconds == 0 || ttl_seconds > MAX_TTL_SECONDS {
            return Err(AppError::InvalidStrategy(format!(
                "ttl_seconds must be between 1 and {}",
                MAX_TTL_SECONDS
            )));
        }
        self.store.extend(key, ttl_seconds).await
    }

    /// Runs the backend sweep of expired records.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.store.purge_expired().await?;
        get_metrics().record_sweep(self.store.backend().as_str(), removed);
        Ok(removed)
    }
}

/// Background sweep of expired claims.
pub struct IdempotencyCleanupJob {
    engine: IdempotencyEngine,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(engine: IdempotencyEngine, interval_seconds: u64) -> Self {
        Self {
            engine,
            interval_seconds: interval_seconds.max(1),
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.engine.purge_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds));

            loop {
                interval.tick().await;

                match self.engine.purge_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
