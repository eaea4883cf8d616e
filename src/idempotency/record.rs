use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a claim.
///
/// `Expired` is never persisted; readers derive it once `now >= expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyState {
    Pending,
    Success,
    Failed,
    Expired,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::Pending => "PENDING",
            IdempotencyState::Success => "SUCCESS",
            IdempotencyState::Failed => "FAILED",
            IdempotencyState::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, IdempotencyState::Pending)
    }
}

impl fmt::Display for IdempotencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(IdempotencyState::Pending),
            "SUCCESS" => Ok(IdempotencyState::Success),
            "FAILED" => Ok(IdempotencyState::Failed),
            "EXPIRED" => Ok(IdempotencyState::Expired),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "Unknown idempotency state: {}",
                other
            ))),
        }
    }
}

/// Persisted claim for one canonical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: IdempotencyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh PENDING claim expiring `ttl_seconds` after `now`.
    pub fn pending(key: impl Into<String>, ttl_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            state: IdempotencyState::Pending,
            created_at: now,
            expires_at: expiry_from(now, ttl_seconds),
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        !self.is_live_at(Utc::now())
    }

    /// State as seen by a reader at `now`.
    pub fn effective_state(&self, now: DateTime<Utc>) -> IdempotencyState {
        if self.is_live_at(now) {
            self.state
        } else {
            IdempotencyState::Expired
        }
    }

    /// Time left on the claim, zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// `now + ttl_seconds`, saturating instead of overflowing on absurd TTLs.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = Duration::seconds(ttl_seconds.min(i64::MAX as u64 / 1000) as i64);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record_window() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending("http:POST /orders:order-123", 300, now);

        assert_eq!(record.state, IdempotencyState::Pending);
        assert_eq!(record.expires_at - record.created_at, Duration::seconds(300));
        assert!(record.is_live_at(now));
        assert!(!record.is_expired());
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending("job:sweep:1", 1, now);

        assert!(record.is_live_at(now + Duration::milliseconds(999)));
        assert!(!record.is_live_at(now + Duration::seconds(1)));
        assert_eq!(
            record.effective_state(now + Duration::seconds(1)),
            IdempotencyState::Expired
        );
    }

    #[test]
    fn test_effective_state_keeps_written_state_while_live() {
        let now = Utc::now();
        let mut record = IdempotencyRecord::pending("mq:payments:msg-1", 60, now);
        record.state = IdempotencyState::Success;
        assert_eq!(record.effective_state(now), IdempotencyState::Success);
    }

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending("mq:payments:msg-2", 10, now);
        assert_eq!(
            record.remaining_ttl(now + Duration::seconds(4)),
            std::time::Duration::from_secs(6)
        );
        assert_eq!(
            record.remaining_ttl(now + Duration::seconds(20)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn test_state_strings() {
        for state in [
            IdempotencyState::Pending,
            IdempotencyState::Success,
            IdempotencyState::Failed,
            IdempotencyState::Expired,
        ] {
            assert_eq!(state.as_str().parse::<IdempotencyState>().unwrap(), state);
        }
        assert!("DONE".parse::<IdempotencyState>().is_err());
        assert!(!IdempotencyState::Pending.is_terminal());
        assert!(IdempotencyState::Success.is_terminal());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending("job:forever:1", u64::MAX, now);
        assert!(record.expires_at > now);
    }
}
