//! Error types for the fork orchestrator.

use std::path::PathBuf;
use thiserror::Error;

use crate::fork::ForkStatus;
use crate::sandbox::SandboxError;

/// Top-level error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Orchestration configuration or request is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run store could not read or write a record.
    #[error("run store error: {0}")]
    Store(String),

    /// A persisted record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error while touching local state.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No run with this identifier is known.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A fork record was asked to make a transition its state machine forbids.
    #[error("fork {run_id}/{fork_number}: invalid transition {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        fork_number: u32,
        from: ForkStatus,
        to: ForkStatus,
    },

    /// The sandbox backend failed outside of a fork pipeline (e.g. while sweeping).
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// The file store's directory path exists but is not a directory.
    #[error("run store directory is not a directory: {0}")]
    InvalidStoreDir(PathBuf),
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure of one stage of the fork pipeline.
///
/// These never leave the executor as errors: they are folded into the fork's
/// terminal status and error message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Sandbox creation failed.
    #[error("sandbox provisioning failed: {message}")]
    Provisioning { message: String, retryable: bool },

    /// The sandbox disappeared underneath the fork.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// The sandbox exists but did not respond to the no-op check.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// The agent process exited non-zero or crashed.
    #[error("agent execution failed: {0}")]
    AgentExecution(String),

    /// The agent exceeded its wall-clock budget.
    #[error("agent timed out after {0}s")]
    AgentTimeout(u64),

    /// The run's budget ceiling was reached before this work could start.
    #[error("budget exceeded: spent ${spent:.2} of ${limit:.2}")]
    BudgetExceeded { spent: f64, limit: f64 },

    /// The run was cancelled while this fork was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Returns true if the stage may be attempted again under its retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Provisioning { retryable, .. } => *retryable,
            StageError::AgentExecution(_) => true,
            StageError::NotFound(_)
            | StageError::HealthCheckFailed(_)
            | StageError::AgentTimeout(_)
            | StageError::BudgetExceeded { .. }
            | StageError::Cancelled => false,
        }
    }

    /// Terminal fork status this error resolves to once retries are exhausted.
    pub fn terminal_status(&self) -> ForkStatus {
        match self {
            StageError::AgentTimeout(_) => ForkStatus::Timeout,
            StageError::BudgetExceeded { .. } => ForkStatus::BudgetExceeded,
            StageError::Cancelled => ForkStatus::Cancelled,
            _ => ForkStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_provisioning_errors_are_not_retryable() {
        let transient = StageError::Provisioning {
            message: "503".to_string(),
            retryable: true,
        };
        let auth = StageError::Provisioning {
            message: "invalid api key".to_string(),
            retryable: false,
        };

        assert!(transient.is_retryable());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn only_agent_execution_and_transient_provisioning_retry() {
        assert!(StageError::AgentExecution("exit 1".to_string()).is_retryable());
        assert!(!StageError::NotFound("sbx".to_string()).is_retryable());
        assert!(!StageError::HealthCheckFailed("dead".to_string()).is_retryable());
        assert!(!StageError::AgentTimeout(60).is_retryable());
        assert!(!StageError::Cancelled.is_retryable());
        assert!(!StageError::BudgetExceeded {
            spent: 2.0,
            limit: 2.0
        }
        .is_retryable());
    }

    #[test]
    fn stage_errors_map_to_terminal_statuses() {
        assert_eq!(
            StageError::AgentTimeout(30).terminal_status(),
            ForkStatus::Timeout
        );
        assert_eq!(StageError::Cancelled.terminal_status(), ForkStatus::Cancelled);
        assert_eq!(
            StageError::BudgetExceeded {
                spent: 1.0,
                limit: 1.0
            }
            .terminal_status(),
            ForkStatus::BudgetExceeded
        );
        assert_eq!(
            StageError::HealthCheckFailed("not running".to_string()).terminal_status(),
            ForkStatus::Failed
        );
    }

    #[test]
    fn budget_error_formats_amounts() {
        let err = StageError::BudgetExceeded {
            spent: 2.0,
            limit: 2.0,
        };
        assert_eq!(err.to_string(), "budget exceeded: spent $2.00 of $2.00");
    }
}
