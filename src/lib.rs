//! Sandbox Fork Orchestrator
//!
//! Fans a single agent request out into N isolated sandboxes ("forks"), runs
//! the same prompt in each under a concurrency cap and an optional cost
//! budget, and fans the results back into one run-level aggregate. Every
//! sandbox that gets provisioned is torn down, either by its own fork's
//! cleanup stage or, failing that, by the background sweeper.

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod fork;
pub mod journal;
pub mod lease;
pub mod metrics;
pub mod orchestrator;
pub mod run;
pub mod runner;
pub mod sandbox;
pub mod signal;
pub mod store;
pub mod sweeper;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use config::{
    OrchestratorConfig, StoreConfig, StoreKind, SweeperConfig, Validate, ValidationResult,
};
pub use controller::{RunController, RunHandle};
pub use error::{Error, Result, StageError};
pub use executor::{ExecutorSettings, ForkExecutor, ForkSpec};
pub use fork::{ForkOutcome, ForkRecord, ForkStatus, StageAttempts};
pub use journal::{Stage, StepJournal, StepRecord};
pub use lease::SandboxLease;
pub use metrics::RunMetrics;
pub use orchestrator::Orchestrator;
pub use run::{OrchestrationRequest, OrchestrationRun, RunProgress, RunSummary, StatusCounts};
pub use runner::{parse_usage, AgentInvocation, AgentRunner, AgentUsage, ClaudeRunner};
pub use sandbox::{
    CommandOutput, LocalSandboxBackend, SandboxBackend, SandboxError, SandboxHandle, SandboxId,
    SandboxInfo, SandboxRequest,
};
pub use signal::RunSignal;
pub use store::{FileStore, MemoryStore, RunStore};
pub use sweeper::{CleanupSweeper, SweepReport};
