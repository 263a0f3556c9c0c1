//! Run-scoped metrics aggregate.
//!
//! Derived incrementally from fork outcomes as they are reported; the fork
//! records remain the source of truth.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fork::ForkOutcome;

/// Aggregate counters for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Owning run.
    pub run_id: String,
    /// Forks in the run.
    pub total_forks: u32,
    /// Forks that succeeded.
    pub completed: u32,
    /// Forks in any other terminal status.
    pub failed: u32,
    /// Cost of every reported fork, in USD.
    pub total_cost_usd: f64,
    /// Input tokens of every reported fork.
    pub total_input_tokens: u64,
    /// Output tokens of every reported fork.
    pub total_output_tokens: u64,
    /// Mean wall-clock duration of forks that actually executed, in seconds.
    pub avg_duration_secs: f64,
    /// Number of forks folded into `avg_duration_secs`.
    pub timed_forks: u32,
}

impl RunMetrics {
    /// Creates an empty aggregate for a run of `total_forks`.
    pub fn new(run_id: impl Into<String>, total_forks: u32) -> Self {
        Self {
            run_id: run_id.into(),
            total_forks,
            completed: 0,
            failed: 0,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            avg_duration_secs: 0.0,
            timed_forks: 0,
        }
    }

    /// Folds one terminal outcome into the aggregate.
    pub fn record(&mut self, outcome: &ForkOutcome) {
        if outcome.status.is_completed() {
            self.completed += 1;
        } else if outcome.status.is_failed() {
            self.failed += 1;
        }
        self.total_cost_usd += outcome.cost_usd.max(0.0);
        self.total_input_tokens += outcome.input_tokens;
        self.total_output_tokens += outcome.output_tokens;

        if outcome.duration > Duration::ZERO {
            self.record_duration(outcome.duration);
        }
    }

    /// Counts a fork that terminated without an executor (short-circuited while pending).
    pub fn record_skipped(&mut self) {
        self.failed += 1;
    }

    fn record_duration(&mut self, duration: Duration) {
        self.timed_forks += 1;
        let n = self.timed_forks as f64;
        self.avg_duration_secs += (duration.as_secs_f64() - self.avg_duration_secs) / n;
    }

    /// Average fork duration.
    pub fn avg_duration(&self) -> Duration {
        Duration::from_secs_f64(self.avg_duration_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::{ForkStatus, StageAttempts};

    fn outcome(status: ForkStatus, cost: f64, secs: u64) -> ForkOutcome {
        ForkOutcome {
            run_id: "r1".to_string(),
            fork_number: 1,
            status,
            cost_usd: cost,
            input_tokens: 10,
            output_tokens: 5,
            error: None,
            sandbox_id: None,
            attempts: StageAttempts::default(),
            duration: Duration::from_secs(secs),
        }
    }

    #[test]
    fn metrics_start_empty() {
        let metrics = RunMetrics::new("r1", 4);
        assert_eq!(metrics.total_forks, 4);
        assert_eq!(metrics.completed + metrics.failed, 0);
        assert_eq!(metrics.avg_duration(), Duration::ZERO);
    }

    #[test]
    fn metrics_keep_running_average() {
        let mut metrics = RunMetrics::new("r1", 3);
        metrics.record(&outcome(ForkStatus::Success, 1.0, 10));
        metrics.record(&outcome(ForkStatus::Success, 1.0, 20));
        metrics.record(&outcome(ForkStatus::Timeout, 0.5, 30));

        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.total_cost_usd, 2.5);
        assert_eq!(metrics.total_input_tokens, 30);
        assert_eq!(metrics.avg_duration(), Duration::from_secs(20));
    }

    #[test]
    fn instant_outcomes_do_not_skew_average() {
        let mut metrics = RunMetrics::new("r1", 2);
        metrics.record(&outcome(ForkStatus::Success, 1.0, 8));
        metrics.record(&outcome(ForkStatus::BudgetExceeded, 0.0, 0));
        metrics.record_skipped();

        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.timed_forks, 1);
        assert_eq!(metrics.avg_duration(), Duration::from_secs(8));
    }
}
