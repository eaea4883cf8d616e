use crate::error::Result;
use crate::idempotency::engine::{IdempotencyEngine, IdempotencyError, Outcome};
use crate::idempotency::key::{IdempotencyKey, KeyResolver};
use crate::idempotency::record::{IdempotencyRecord, IdempotencyState};
use crate::idempotency::store::IdempotencyStore;
use crate::idempotency::strategy::IdempotencyStrategy;
use std::future::Future;
use std::sync::Arc;

/// Metrics label for requests whose key never parsed.
const UNRESOLVED_NAMESPACE: &str = "unresolved";

/// Entry point for call sites that want "run this at most once".
///
/// Holds the engine and the strategy used when a call does not bring its
/// own. Cloning is cheap.
#[derive(Clone)]
pub struct IdempotencyFacade {
    engine: IdempotencyEngine,
    default_strategy: IdempotencyStrategy,
}

impl IdempotencyFacade {
    pub fn new(engine: IdempotencyEngine, default_strategy: IdempotencyStrategy) -> Self {
        Self {
            engine,
            default_strategy,
        }
    }

    pub fn with_store(store: Arc<dyn IdempotencyStore>, default_strategy: IdempotencyStrategy) -> Self {
        Self::new(IdempotencyEngine::new(store), default_strategy)
    }

    pub fn engine(&self) -> &IdempotencyEngine {
        &self.engine
    }

    pub fn default_strategy(&self) -> &IdempotencyStrategy {
        &self.default_strategy
    }

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
        self.engine.execute(key, strategy, work).await
    }

    /// Same as [`execute`](Self::execute) with the default strategy.
    pub async fn execute_default<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        work: F,
    ) -> std::result::Result<Outcome<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.engine.execute(key, &self.default_strategy, work).await
    }

    /// Parses `canonical` first; a malformed key fails with `InvalidKey`
    /// without touching the store.
    pub async fn execute_canonical<T, E, F, Fut>(
        &self,
        canonical: &str,
        strategy: &IdempotencyStrategy,
        work: F,
    ) -> std::result::Result<Outcome<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let key = IdempotencyKey::parse(canonical)
            .map_err(|e| self.engine.reject_invalid(UNRESOLVED_NAMESPACE, e))?;
        self.engine.execute(&key, strategy, work).await
    }

    /// Derives the key from `input` with `resolver`, then executes.
    pub async fn execute_resolved<I, R, T, E, F, Fut>(
        &self,
        resolver: &R,
        input: &I,
        strategy: &IdempotencyStrategy,
        work: F,
    ) -> std::result::Result<Outcome<T>, IdempotencyError<E>>
    where
        I: ?Sized,
        R: KeyResolver<I> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let key = resolver
            .resolve(input)
            .map_err(|e| self.engine.reject_invalid(UNRESOLVED_NAMESPACE, e))?;
        self.engine.execute(&key, strategy, work).await
    }

    /// State of the live record for `key`; `None` when unclaimed or expired.
    pub async fn status(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyState>> {
        Ok(self.engine.inspect(key).await?.map(|record| record.state))
    }

    pub async fn record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.engine.inspect(key).await
    }

    pub async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        self.engine.release(key).await
    }
}
