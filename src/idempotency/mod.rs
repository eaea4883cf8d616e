//! Duplicate suppression for protected operations.
//!
//! A caller derives an [`IdempotencyKey`], picks an [`IdempotencyStrategy`]
//! and hands its work to the [`IdempotencyFacade`]. The work runs only for
//! the caller that wins the atomic claim in the configured store.

pub mod engine;
pub mod facade;
pub mod key;
pub mod record;
pub mod store;
pub mod strategy;

pub use engine::{
    IdempotencyCleanupJob, IdempotencyEngine, IdempotencyError, IdempotencyMetrics,
    MetricsSnapshot, Outcome,
};
pub use facade::IdempotencyFacade;
pub use key::{
    IdempotencyKey, KeyResolver, MAX_KEY_LENGTH, NAMESPACE_HTTP, NAMESPACE_JOB, NAMESPACE_MQ,
};
pub use record::{IdempotencyRecord, IdempotencyState};
pub use store::{
    IdempotencyStore, MemoryIdempotencyStore, PostgresIdempotencyStore, RedisIdempotencyStore,
    StoreBackend,
};
pub use strategy::{IdempotencyStrategy, DEFAULT_TTL_SECONDS, MAX_TTL_SECONDS};
