//! Retry backoff and dead-letter escalation policy.

use chrono::{DateTime, Duration, Utc};

use crate::operation::QueueItem;

/// Pure policy computing retry schedules and dead-letter eligibility.
///
/// The delay for a record is `base_delay * 2^retry_count`, capped at
/// `max_delay` and anchored at the record's `last_attempt_at`. Below the cap
/// the delay is strictly increasing in the retry count; that monotonicity is
/// a required property, not an implementation detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts after which a record is escalated to the dead-letter store.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Creates a policy with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::seconds(2),
            max_delay: Duration::minutes(5),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns true once the record's retry budget is exhausted.
    pub fn should_dead_letter(&self, item: &QueueItem) -> bool {
        item.retry_count >= self.max_retries
    }

    /// Computes the delay before the record's next attempt.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // 2^retry with saturation; beyond 62 doublings the cap applies anyway.
        let factor = 1i64.checked_shl(retry_count.min(62)).unwrap_or(i64::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor.try_into().unwrap_or(i32::MAX))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    /// Computes the earliest time the record may re-enter dispatch.
    ///
    /// Anchored at `last_attempt_at`; a record that has never been attempted
    /// is eligible immediately.
    pub fn next_retry_time(&self, item: &QueueItem) -> DateTime<Utc> {
        match item.last_attempt_at {
            Some(anchor) => anchor + self.delay_for(item.retry_count),
            None => item.created_at,
        }
    }
}

impl Default for BackoffPolicy {
    /// Production default: five attempts, 2s base, 5min ceiling.
    fn default() -> Self {
        Self::new(5)
    }
}
