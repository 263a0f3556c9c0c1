//! Orchestration runs: the request, the run-level aggregate, and the views
//! returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fork::{ForkRecord, ForkStatus};

/// A caller's request to fan one prompt out over N forks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Caller-chosen run id; generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,

    /// Repository each fork clones.
    pub repo_url: String,

    /// Branch each fork works on.
    pub branch: String,

    /// Prompt handed to every fork's agent.
    pub prompt: String,

    /// Number of forks, at least 1.
    pub num_forks: u32,

    /// Model identifier passed to the agent.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum forks running at once, at least 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Wall-clock budget for one fork's agent stage, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Soft cost ceiling for the whole run, in USD.
    #[serde(default)]
    pub budget_limit_usd: Option<f64>,
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    1800
}

impl OrchestrationRequest {
    /// Creates a request with default model, concurrency and timeout.
    pub fn new(
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        prompt: impl Into<String>,
        num_forks: u32,
    ) -> Self {
        Self {
            run_id: None,
            repo_url: repo_url.into(),
            branch: branch.into(),
            prompt: prompt.into(),
            num_forks,
            model: default_model(),
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_timeout_seconds(),
            budget_limit_usd: None,
        }
    }

    /// Sets an explicit run id.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the concurrency cap.
    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Sets the per-fork timeout.
    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Sets the budget ceiling.
    pub fn with_budget_limit_usd(mut self, limit: f64) -> Self {
        self.budget_limit_usd = Some(limit);
        self
    }
}

/// Number of forks in each terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: u32,
    pub failed: u32,
    pub timeout: u32,
    pub budget_exceeded: u32,
    pub cancelled: u32,
}

impl StatusCounts {
    /// Counts one more fork in `status`. Non-terminal statuses are ignored.
    pub fn record(&mut self, status: ForkStatus) {
        match status {
            ForkStatus::Success => self.success += 1,
            ForkStatus::Failed => self.failed += 1,
            ForkStatus::Timeout => self.timeout += 1,
            ForkStatus::BudgetExceeded => self.budget_exceeded += 1,
            ForkStatus::Cancelled => self.cancelled += 1,
            ForkStatus::Pending | ForkStatus::Running => {}
        }
    }

    /// Forks that succeeded.
    pub fn completed(&self) -> u32 {
        self.success
    }

    /// Forks that reached any other terminal status.
    pub fn failed_total(&self) -> u32 {
        self.failed + self.timeout + self.budget_exceeded + self.cancelled
    }

    /// All terminal forks.
    pub fn terminal(&self) -> u32 {
        self.completed() + self.failed_total()
    }
}

/// Run-level state owned by the controller for the run's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    /// Run identifier.
    pub run_id: String,
    /// The request this run executes.
    pub request: OrchestrationRequest,
    /// Cost accrued from reported forks, in USD.
    pub total_cost_usd: f64,
    /// Terminal forks per status.
    pub counts: StatusCounts,
    /// Admission is suspended while set.
    pub paused: bool,
    /// Set once a cancel signal has been observed.
    pub cancelled: bool,
    /// When the run was submitted.
    pub started_at: DateTime<Utc>,
    /// Set once every fork is terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    /// Creates a fresh run.
    pub fn new(run_id: impl Into<String>, request: OrchestrationRequest) -> Self {
        Self {
            run_id: run_id.into(),
            request,
            total_cost_usd: 0.0,
            counts: StatusCounts::default(),
            paused: false,
            cancelled: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Number of forks in this run.
    pub fn num_forks(&self) -> u32 {
        self.request.num_forks
    }

    /// Forks that succeeded.
    pub fn completed_count(&self) -> u32 {
        self.counts.completed()
    }

    /// Forks that reached any other terminal status.
    pub fn failed_count(&self) -> u32 {
        self.counts.failed_total()
    }

    /// Returns true once every fork has reported a terminal status.
    pub fn all_forks_terminal(&self) -> bool {
        self.counts.terminal() >= self.num_forks()
    }

    /// Returns true if the soft budget has been reached.
    pub fn budget_exhausted(&self) -> bool {
        self.request
            .budget_limit_usd
            .map(|limit| self.total_cost_usd >= limit)
            .unwrap_or(false)
    }

    /// Folds one terminal fork into the aggregate.
    pub fn record_terminal(&mut self, status: ForkStatus, cost_usd: f64) {
        self.counts.record(status);
        self.total_cost_usd += cost_usd.max(0.0);
    }
}

/// Snapshot returned by a progress query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub num_forks: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub total_cost_usd: f64,
    pub counts: StatusCounts,
    pub paused: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-fork status, ordered by fork number.
    pub forks: Vec<ForkRecord>,
}

impl RunProgress {
    /// Builds a progress view from persisted records.
    pub fn from_records(run: &OrchestrationRun, forks: Vec<ForkRecord>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            num_forks: run.num_forks(),
            completed_count: run.completed_count(),
            failed_count: run.failed_count(),
            total_cost_usd: run.total_cost_usd,
            counts: run.counts,
            paused: run.paused,
            cancelled: run.cancelled,
            started_at: run.started_at,
            completed_at: run.completed_at,
            forks,
        }
    }

    /// Returns true once the run has completed.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Number of forks currently in `status`.
    pub fn count_in(&self, status: ForkStatus) -> usize {
        self.forks.iter().filter(|fork| fork.status == status).count()
    }
}

/// One line of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub repo_url: String,
    pub branch: String,
    pub num_forks: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub total_cost_usd: f64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&OrchestrationRun> for RunSummary {
    fn from(run: &OrchestrationRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            repo_url: run.request.repo_url.clone(),
            branch: run.request.branch.clone(),
            num_forks: run.num_forks(),
            completed_count: run.completed_count(),
            failed_count: run.failed_count(),
            total_cost_usd: run.total_cost_usd,
            cancelled: run.cancelled,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}
