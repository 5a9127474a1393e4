//! Configuration for the orchestrator.

use chrono::Duration;
use ledgersync_queue::BackoffPolicy;

/// Tunables for the dispatch loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry/backoff policy applied to transient failures.
    pub backoff: BackoffPolicy,
    /// Age after which an `InProgress` record from a dead process is treated
    /// as a failed attempt.
    pub stale_after: Duration,
    /// Maximum number of dispatches per cycle.
    pub batch_limit: usize,
    /// Sleep between cycles when running the continuous loop.
    pub poll_interval: std::time::Duration,
}

impl EngineConfig {
    /// Creates the production-default configuration.
    pub fn new() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            stale_after: Duration::minutes(10),
            batch_limit: 100,
            poll_interval: std::time::Duration::from_secs(30),
        }
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the staleness threshold for `InProgress` recovery.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the per-cycle dispatch limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Sets the continuous-loop poll interval.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::new()
            .with_batch_limit(10)
            .with_stale_after(Duration::minutes(2))
            .with_backoff(BackoffPolicy::new(3));

        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.stale_after, Duration::minutes(2));
        assert_eq!(config.backoff.max_retries, 3);
    }
}
