use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// One year. Keeps `created_at + ttl` storable as TIMESTAMPTZ and within
/// what Redis accepts for `EX`.
pub const MAX_TTL_SECONDS: u64 = 31_536_000;

/// Per-call-site policy for a protected operation.
///
/// `fail_open` defaults to `true`: when the store is unreachable the work runs
/// anyway, so duplicates are possible during an outage. Call sites that must
/// never run twice should use [`IdempotencyStrategy::fail_closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencyStrategy {
    /// Window during which duplicate claims are rejected.
    #[validate(range(min = 1, max = 31536000))]
    pub ttl_seconds: u64,
    /// Run the work when the store itself is unreachable.
    pub fail_open: bool,
}

impl Default for IdempotencyStrategy {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            fail_open: true,
        }
    }
}

impl IdempotencyStrategy {
    pub fn new(ttl_seconds: u64, fail_open: bool) -> Result<Self> {
        let strategy = Self {
            ttl_seconds,
            fail_open,
        };
        strategy.ensure_valid()?;
        Ok(strategy)
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Result<Self> {
        self.ttl_seconds = ttl_seconds;
        self.ensure_valid()?;
        Ok(self)
    }

    pub fn fail_closed(mut self) -> Self {
        self.fail_open = false;
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::InvalidStrategy(e.to_string()))
    }
}
