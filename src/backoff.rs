//! Exponential backoff and per-stage retry policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, doubling, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            multiplier: 2.0,
            current: initial,
        }
    }

    /// Sets the growth factor applied on each `next()`.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (multiplies, capped at max).
    pub fn next(&mut self) {
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = next.min(self.max);
    }
}

/// How many times a pipeline stage may run and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that runs the stage exactly once.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Sandbox creation: 3 attempts, 5s base, x2.
    pub const fn create_sandbox() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    /// Agent run: 2 attempts, 10s base, x2.
    pub const fn run_agent() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 10_000,
            multiplier: 2.0,
            max_delay_ms: 120_000,
        }
    }

    /// Sandbox cleanup: 3 attempts, 2s base, x2.
    pub const fn cleanup_sandbox() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }

    /// Returns a fresh backoff schedule for this policy.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        )
        .with_multiplier(self.multiplier)
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_starts_at_initial() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_on_next() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(10));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(20));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(100), Duration::from_secs(300));
        backoff.next(); // 200
        backoff.next(); // 400 -> capped to 300
        assert_eq!(backoff.current(), Duration::from_secs(300));
    }

    #[test]
    fn backoff_honours_custom_multiplier() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_multiplier(3.0);
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(3));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(9));
    }

    #[test]
    fn stage_policies_match_pipeline_table() {
        let create = RetryPolicy::create_sandbox();
        assert_eq!(create.max_attempts, 3);
        assert_eq!(create.backoff().current(), Duration::from_secs(5));

        let agent = RetryPolicy::run_agent();
        assert_eq!(agent.max_attempts, 2);
        assert_eq!(agent.backoff().current(), Duration::from_secs(10));

        let cleanup = RetryPolicy::cleanup_sandbox();
        assert_eq!(cleanup.max_attempts, 3);
        assert_eq!(cleanup.backoff().current(), Duration::from_secs(2));
    }

    #[test]
    fn allows_another_counts_first_attempt() {
        let policy = RetryPolicy::create_sandbox();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));

        assert!(!RetryPolicy::once().allows_another(1));
    }

    #[test]
    fn zero_attempt_policy_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::once()
        };
        assert!(policy.allows_another(0));
        assert!(!policy.allows_another(1));
    }
}
