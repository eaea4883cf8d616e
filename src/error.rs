use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Idempotency store unavailable ({backend}): {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },

    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Invalid idempotency strategy: {0}")]
    InvalidStrategy(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        AppError::BackendUnavailable {
            backend,
            message: message.into(),
        }
    }

    /// True for faults of the storage backend itself (connection refused,
    /// timeouts, driver errors), as opposed to caller mistakes.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Migration(_)
                | AppError::Redis(_)
                | AppError::BackendUnavailable { .. }
        )
    }

    /// True for errors raised before any storage call was attempted.
    pub fn is_rejected_input(&self) -> bool {
        matches!(self, AppError::InvalidKey(_) | AppError::InvalidStrategy(_))
    }
}
