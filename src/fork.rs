//! Per-fork records and their state machine.
//!
//! A fork moves `pending -> running -> {success | failed | timeout |
//! budget_exceeded | cancelled}`. `pending` may also short-circuit straight to
//! `budget_exceeded` or `cancelled` without ever provisioning a sandbox. Once a
//! record is terminal it is frozen.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runner::AgentUsage;
use crate::sandbox::SandboxId;

/// Status of one fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkStatus {
    /// Waiting for admission.
    Pending,
    /// Admitted; the pipeline is executing.
    Running,
    /// Agent completed with exit code 0.
    Success,
    /// A stage failed without recovery.
    Failed,
    /// The agent exceeded its wall-clock budget.
    Timeout,
    /// The run's budget ceiling was reached before this fork could provision.
    BudgetExceeded,
    /// The run was cancelled before or during this fork.
    Cancelled,
}

impl ForkStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ForkStatus; 7] = [
        ForkStatus::Pending,
        ForkStatus::Running,
        ForkStatus::Success,
        ForkStatus::Failed,
        ForkStatus::Timeout,
        ForkStatus::BudgetExceeded,
        ForkStatus::Cancelled,
    ];

    /// Returns true for statuses no record can leave.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ForkStatus::Pending | ForkStatus::Running)
    }

    /// Terminal statuses that count toward the run's completed total.
    pub fn is_completed(self) -> bool {
        self == ForkStatus::Success
    }

    /// Terminal statuses that count toward the run's failed total.
    pub fn is_failed(self) -> bool {
        self.is_terminal() && !self.is_completed()
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ForkStatus) -> bool {
        match self {
            ForkStatus::Pending => matches!(
                next,
                ForkStatus::Running | ForkStatus::BudgetExceeded | ForkStatus::Cancelled
            ),
            ForkStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            ForkStatus::Pending => "pending",
            ForkStatus::Running => "running",
            ForkStatus::Success => "success",
            ForkStatus::Failed => "failed",
            ForkStatus::Timeout => "timeout",
            ForkStatus::BudgetExceeded => "budget_exceeded",
            ForkStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many times each retried stage actually ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    /// Sandbox creation attempts.
    pub create: u32,
    /// Agent run attempts.
    pub agent: u32,
    /// Sandbox kill attempts.
    pub cleanup: u32,
}

/// Persisted state of one fork, keyed by `(run_id, fork_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkRecord {
    /// Owning run.
    pub run_id: String,
    /// Stable fork number, 1..=N.
    pub fork_number: u32,
    /// Current status.
    pub status: ForkStatus,
    /// Sandbox provisioned for this fork, once created.
    #[serde(default)]
    pub sandbox_id: Option<SandboxId>,
    /// Accrued agent cost in USD.
    #[serde(default)]
    pub cost_usd: f64,
    /// Accrued input tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Accrued output tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Failure description; only present for `failed` and `timeout`.
    #[serde(default)]
    pub error: Option<String>,
    /// Stage attempt counters.
    #[serde(default)]
    pub attempts: StageAttempts,
    /// When the fork was admitted.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the fork reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ForkRecord {
    /// Creates a pending record.
    pub fn new(run_id: impl Into<String>, fork_number: u32) -> Self {
        Self {
            run_id: run_id.into(),
            fork_number,
            status: ForkStatus::Pending,
            sandbox_id: None,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            error: None,
            attempts: StageAttempts::default(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Store key for this record.
    pub fn key(&self) -> String {
        crate::store::fork_key(&self.run_id, self.fork_number)
    }

    /// Returns true once the record is frozen.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_mutable(&self, to: ForkStatus) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidTransition {
                run_id: self.run_id.clone(),
                fork_number: self.fork_number,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Moves the record to `next`, stamping start and completion times.
    pub fn transition(&mut self, next: ForkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                run_id: self.run_id.clone(),
                fork_number: self.fork_number,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == ForkStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Records the sandbox provisioned for this fork.
    pub fn attach_sandbox(&mut self, sandbox_id: impl Into<SandboxId>) -> Result<()> {
        self.ensure_mutable(self.status)?;
        self.sandbox_id = Some(sandbox_id.into());
        Ok(())
    }

    /// Records the fork's cumulative agent usage. Totals never decrease, so
    /// recording the same usage twice is a no-op.
    pub fn record_usage(&mut self, usage: &AgentUsage) -> Result<()> {
        self.ensure_mutable(self.status)?;
        self.cost_usd = self.cost_usd.max(usage.cost_usd);
        self.input_tokens = self.input_tokens.max(usage.input_tokens);
        self.output_tokens = self.output_tokens.max(usage.output_tokens);
        Ok(())
    }

    /// Applies an executor's terminal outcome and freezes the record.
    ///
    /// Totals never decrease: the larger of the recorded and reported values wins.
    pub fn finish(&mut self, outcome: &ForkOutcome) -> Result<()> {
        self.ensure_mutable(outcome.status)?;
        self.cost_usd = self.cost_usd.max(outcome.cost_usd);
        self.input_tokens = self.input_tokens.max(outcome.input_tokens);
        self.output_tokens = self.output_tokens.max(outcome.output_tokens);
        self.attempts = outcome.attempts;
        if outcome.sandbox_id.is_some() {
            self.sandbox_id = outcome.sandbox_id.clone();
        }
        self.error = match outcome.status {
            ForkStatus::Failed | ForkStatus::Timeout => outcome.error.clone(),
            _ => None,
        };
        self.transition(outcome.status)
    }
}

/// Terminal report of one fork, sent from its executor to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkOutcome {
    /// Owning run.
    pub run_id: String,
    /// Fork number.
    pub fork_number: u32,
    /// Terminal status.
    pub status: ForkStatus,
    /// Total agent cost in USD.
    pub cost_usd: f64,
    /// Total input tokens.
    pub input_tokens: u64,
    /// Total output tokens.
    pub output_tokens: u64,
    /// Failure description for unhappy outcomes.
    pub error: Option<String>,
    /// Sandbox that was provisioned, if any.
    pub sandbox_id: Option<SandboxId>,
    /// Stage attempt counters.
    pub attempts: StageAttempts,
    /// Wall-clock time from admission to terminal status.
    pub duration: Duration,
}

impl ForkOutcome {
    /// Builds an outcome for a fork that never provisioned a sandbox.
    pub fn short_circuit(
        run_id: impl Into<String>,
        fork_number: u32,
        status: ForkStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            fork_number,
            status,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            error,
            sandbox_id: None,
            attempts: StageAttempts::default(),
            duration: Duration::ZERO,
        }
    }
}
