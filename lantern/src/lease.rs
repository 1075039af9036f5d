use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobEnvelope;

/// Unique identifier for a job lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job handed to one worker for a bounded time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    /// Unique identifier for this lease.
    pub lease_id: LeaseId,
    pub envelope: JobEnvelope,
    /// ID of the worker holding this lease.
    pub worker_id: String,
    /// Timestamp when the lease expires.
    pub expires_at: DateTime<Utc>,
    /// 1-based delivery count, including this one.
    pub attempt: u32,
    /// Lease length in milliseconds; renewals extend by the same amount.
    pub ttl_ms: i64,
}

impl JobLease {
    pub fn new(envelope: JobEnvelope, worker_id: String, lease_ttl: Duration, attempt: u32) -> Self {
        Self {
            lease_id: LeaseId::new(),
            envelope,
            worker_id,
            expires_at: Utc::now() + lease_ttl,
            attempt,
            ttl_ms: lease_ttl.num_milliseconds(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::milliseconds(self.ttl_ms)
    }

    /// How often the holder renews the lease while the job runs: every third
    /// of the ttl. `None` when the ttl is too short to renew.
    pub fn renewal_interval(&self) -> Option<std::time::Duration> {
        let third = self.ttl_ms / 3;
        (third > 0).then(|| std::time::Duration::from_millis(third as u64))
    }

    /// Checks if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_first_attempt(&self) -> bool {
        self.attempt <= 1
    }
}

/// Retry and backoff behaviour for transient job failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the delivery following `attempt`.
    ///
    /// Formula: delay = min(base_delay * 2^(attempt-1), max_backoff)
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::milliseconds(0);
        }

        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_backoff_ms as f64);
        let clamped_ms = capped.max(0.0) as i64;

        Duration::milliseconds(clamped_ms)
    }

    /// True once `attempt` deliveries have used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
