//! Per-fork pipeline: create sandbox, health check, run agent, record usage,
//! clean up.
//!
//! Stage failures are classified into [`StageError`]s, retried according to
//! each stage's [`RetryPolicy`], and finally folded into a [`ForkOutcome`].
//! The executor never fails: every path ends in an outcome, and every sandbox
//! it provisioned is killed before that outcome is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{ExponentialBackoff, RetryPolicy};
use crate::error::{Result, StageError};
use crate::fork::{ForkOutcome, ForkRecord, ForkStatus, StageAttempts};
use crate::journal::{Stage, StepJournal};
use crate::lease::SandboxLease;
use crate::run::OrchestrationRun;
use crate::runner::{AgentInvocation, AgentRunner, AgentUsage, RepoCheckout};
use crate::sandbox::{
    CommandOutput, SandboxBackend, SandboxError, SandboxHandle, SandboxId, SandboxRequest,
};
use crate::store::RunStore;

/// Characters of agent stderr kept in a fork's error message.
const ERROR_TAIL_CHARS: usize = 500;

/// Everything one fork needs to know about its run.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkSpec {
    pub run_id: String,
    pub fork_number: u32,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub model: String,
    /// Wall-clock budget of the agent stage, in seconds.
    pub timeout_secs: u64,
    pub budget_limit_usd: Option<f64>,
}

impl ForkSpec {
    /// Builds the spec of fork `fork_number` of `run`.
    pub fn for_run(run: &OrchestrationRun, fork_number: u32) -> Self {
        let request = &run.request;
        Self {
            run_id: run.run_id.clone(),
            fork_number,
            repo_url: request.repo_url.clone(),
            branch: request.branch.clone(),
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            timeout_secs: request.timeout_seconds.max(1),
            budget_limit_usd: request.budget_limit_usd,
        }
    }
}

/// Deployment-wide knobs of the fork pipeline.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Template for every sandbox; fork identity is added to its env.
    pub sandbox: SandboxRequest,
    /// No-op command proving the sandbox responds.
    pub health_command: String,
    pub health_timeout_secs: u64,
    /// Turn cap handed to the agent CLI.
    pub max_turns: u32,
    /// Checkout directory inside the sandbox.
    pub workdir: String,
    pub create_policy: RetryPolicy,
    pub agent_policy: RetryPolicy,
    pub cleanup_policy: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            sandbox: SandboxRequest::new("base", 3600),
            health_command: "true".to_string(),
            health_timeout_secs: 10,
            max_turns: 50,
            workdir: "repo".to_string(),
            create_policy: RetryPolicy::create_sandbox(),
            agent_policy: RetryPolicy::run_agent(),
            cleanup_policy: RetryPolicy::cleanup_sandbox(),
        }
    }
}

/// Mutable state threaded through one execution.
#[derive(Debug, Default)]
struct Progress {
    attempts: StageAttempts,
    usage: AgentUsage,
    sandbox_id: Option<SandboxId>,
}

/// Runs the pipeline for one fork at a time; shared by every fork of every run.
pub struct ForkExecutor {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn RunStore>,
    runner: Arc<dyn AgentRunner>,
    journal: StepJournal,
    settings: ExecutorSettings,
}

impl ForkExecutor {
    /// Creates an executor over the given collaborators.
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn RunStore>,
        runner: Arc<dyn AgentRunner>,
        settings: ExecutorSettings,
    ) -> Self {
        let journal = StepJournal::new(store.clone());
        Self {
            backend,
            store,
            runner,
            journal,
            settings,
        }
    }

    /// Returns the pipeline settings.
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Executes the fork described by `spec` to a terminal outcome.
    ///
    /// `spent` carries the run's reported total cost; `cancel` interrupts any
    /// stage except cleanup.
    pub async fn execute(
        &self,
        spec: &ForkSpec,
        cancel: CancellationToken,
        spent: watch::Receiver<f64>,
    ) -> ForkOutcome {
        let started = Instant::now();
        let mut progress = Progress::default();

        info!(run_id = %spec.run_id, fork = spec.fork_number, "Fork pipeline starting");
        let result = self.run_stages(spec, &cancel, &spent, &mut progress).await;

        if let Some(sandbox_id) = progress.sandbox_id.clone() {
            self.cleanup(spec, &sandbox_id, &mut progress.attempts).await;
        }

        let (status, error) = match result {
            Ok(()) => (ForkStatus::Success, None),
            Err(e) => (e.terminal_status(), Some(e.to_string())),
        };

        let outcome = ForkOutcome {
            run_id: spec.run_id.clone(),
            fork_number: spec.fork_number,
            status,
            cost_usd: progress.usage.cost_usd,
            input_tokens: progress.usage.input_tokens,
            output_tokens: progress.usage.output_tokens,
            error,
            sandbox_id: progress.sandbox_id,
            attempts: progress.attempts,
            duration: started.elapsed(),
        };

        info!(
            run_id = %spec.run_id,
            fork = spec.fork_number,
            status = %outcome.status,
            cost_usd = outcome.cost_usd,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Fork pipeline finished"
        );
        outcome
    }

    async fn run_stages(
        &self,
        spec: &ForkSpec,
        cancel: &CancellationToken,
        spent: &watch::Receiver<f64>,
        progress: &mut Progress,
    ) -> std::result::Result<(), StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let replayed_sandbox = self
            .journal_output::<SandboxId>(spec, Stage::CreateSandbox)
            .await;
        let sandbox_id = match replayed_sandbox {
            Some(sandbox_id) => {
                info!(run_id = %spec.run_id, fork = spec.fork_number, sandbox_id = %sandbox_id, "Reusing journaled sandbox");
                sandbox_id
            }
            None => {
                check_budget(spec, spent)?;
                self.create_sandbox(spec, cancel, &mut progress.attempts).await?
            }
        };
        progress.sandbox_id = Some(sandbox_id.clone());
        self.acquire_lease(spec, &sandbox_id).await;

        if let Some(usage) = self.journal_output::<AgentUsage>(spec, Stage::RunAgent).await {
            info!(run_id = %spec.run_id, fork = spec.fork_number, "Agent result replayed from journal");
            progress.usage = usage;
        } else {
            // Usage recorded before a restart is the baseline the new
            // attempts add to, so the fork record is never charged twice.
            if let Some(recorded) = self
                .journal_output::<AgentUsage>(spec, Stage::RecordMetrics)
                .await
            {
                info!(
                    run_id = %spec.run_id,
                    fork = spec.fork_number,
                    cost_usd = recorded.cost_usd,
                    "Carrying forward usage recorded before restart"
                );
                progress.usage = recorded;
            }
            let handle = cancellable(cancel, self.health_check(spec, &sandbox_id)).await?;
            let result = self.run_agent(spec, &handle, cancel, spent, progress).await;
            self.record_usage(spec, &progress.usage).await;
            result?;
            self.journal_complete(spec, Stage::RunAgent, &progress.usage)
                .await;
        }

        Ok(())
    }

    async fn create_sandbox(
        &self,
        spec: &ForkSpec,
        cancel: &CancellationToken,
        attempts: &mut StageAttempts,
    ) -> std::result::Result<SandboxId, StageError> {
        let request = self
            .settings
            .sandbox
            .clone()
            .with_env("RUN_ID", spec.run_id.clone())
            .with_env("FORK_NUMBER", spec.fork_number.to_string());
        let policy = self.settings.create_policy;
        let mut backoff = policy.backoff();

        loop {
            attempts.create += 1;
            let attempt = attempts.create;
            self.journal_begin(spec, Stage::CreateSandbox).await;
            debug!(run_id = %spec.run_id, fork = spec.fork_number, attempt, "Creating sandbox");

            let created = cancellable(cancel, async {
                self.backend
                    .create(&request)
                    .await
                    .map_err(provisioning_error)
            })
            .await;

            match created {
                Ok(sandbox_id) => {
                    info!(
                        run_id = %spec.run_id,
                        fork = spec.fork_number,
                        sandbox_id = %sandbox_id,
                        attempts = attempt,
                        "Sandbox created"
                    );
                    self.journal_complete(spec, Stage::CreateSandbox, &sandbox_id)
                        .await;
                    return Ok(sandbox_id);
                }
                Err(error) => {
                    self.pause_before_retry(
                        spec,
                        Stage::CreateSandbox,
                        policy,
                        &mut backoff,
                        attempt,
                        error,
                        cancel,
                    )
                    .await?
                }
            }
        }
    }

    async fn acquire_lease(&self, spec: &ForkSpec, sandbox_id: &str) {
        let lease = SandboxLease::new(sandbox_id, spec.run_id.clone(), spec.fork_number);
        if let Err(e) = self.store.save_lease(&lease).await {
            warn!(sandbox_id = %sandbox_id, error = %e, "Failed to persist sandbox lease");
        }
        let sandbox_id = sandbox_id.to_string();
        self.update_record(spec, move |record| record.attach_sandbox(sandbox_id))
            .await;
    }

    /// Connects, checks liveness, and runs the no-op check. Never retried.
    async fn health_check(
        &self,
        spec: &ForkSpec,
        sandbox_id: &str,
    ) -> std::result::Result<SandboxHandle, StageError> {
        self.journal_begin(spec, Stage::HealthCheck).await;

        let handle = self
            .backend
            .connect(sandbox_id)
            .await
            .map_err(|e| match e {
                SandboxError::NotFound(id) => StageError::NotFound(id),
                other => StageError::HealthCheckFailed(other.to_string()),
            })?;

        let running = self
            .backend
            .is_running(&handle)
            .await
            .map_err(|e| StageError::HealthCheckFailed(e.to_string()))?;
        if !running {
            return Err(StageError::HealthCheckFailed(
                "sandbox is not running".to_string(),
            ));
        }

        let timeout = self.settings.health_timeout_secs.max(1);
        let check = self
            .backend
            .run_command(&handle, &self.settings.health_command, timeout)
            .await
            .map_err(|e| match e {
                SandboxError::Timeout { seconds } => StageError::HealthCheckFailed(format!(
                    "no-op check timed out after {}s",
                    seconds
                )),
                other => StageError::HealthCheckFailed(other.to_string()),
            })?;
        if !check.success() {
            return Err(StageError::HealthCheckFailed(format!(
                "no-op check exited with {}: {}",
                check.exit_code,
                check.error_tail(ERROR_TAIL_CHARS)
            )));
        }

        debug!(run_id = %spec.run_id, fork = spec.fork_number, sandbox_id = %sandbox_id, "Sandbox healthy");
        self.journal_complete(spec, Stage::HealthCheck, &true).await;
        Ok(handle)
    }

    async fn run_agent(
        &self,
        spec: &ForkSpec,
        handle: &SandboxHandle,
        cancel: &CancellationToken,
        spent: &watch::Receiver<f64>,
        progress: &mut Progress,
    ) -> std::result::Result<(), StageError> {
        let checkout = RepoCheckout {
            repo_url: spec.repo_url.clone(),
            branch: spec.branch.clone(),
            workdir: self.settings.workdir.clone(),
        };
        let invocation = AgentInvocation {
            prompt: spec.prompt.clone(),
            model: Some(spec.model.clone()).filter(|model| !model.is_empty()),
            max_turns: self.settings.max_turns,
            workdir: self.settings.workdir.clone(),
        };
        let agent_command = self.runner.build_command(&invocation);
        let deadline = Duration::from_secs(spec.timeout_secs);
        let policy = self.settings.agent_policy;
        let mut backoff = policy.backoff();

        loop {
            // Cost reported by sibling forks may have exhausted the budget
            // while this fork was waiting to retry.
            if progress.attempts.agent > 0 {
                check_budget(spec, spent)?;
            }
            progress.attempts.agent += 1;
            let attempt = progress.attempts.agent;
            self.journal_begin(spec, Stage::RunAgent).await;
            info!(
                run_id = %spec.run_id,
                fork = spec.fork_number,
                attempt,
                runner = self.runner.name(),
                "Running agent"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StageError::Cancelled),
                timed = tokio::time::timeout(
                    deadline,
                    self.agent_attempt(
                        spec,
                        handle,
                        &checkout,
                        &agent_command,
                        &mut progress.usage,
                    ),
                ) => timed.unwrap_or(Err(StageError::AgentTimeout(spec.timeout_secs))),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(error) => {
                    self.pause_before_retry(
                        spec,
                        Stage::RunAgent,
                        policy,
                        &mut backoff,
                        attempt,
                        error,
                        cancel,
                    )
                    .await?
                }
            }
        }
    }

    /// One clone, checkout and agent invocation. Usage is added to `usage`
    /// even when the agent exits non-zero.
    async fn agent_attempt(
        &self,
        spec: &ForkSpec,
        handle: &SandboxHandle,
        checkout: &RepoCheckout,
        agent_command: &str,
        usage: &mut AgentUsage,
    ) -> std::result::Result<(), StageError> {
        let timeout = spec.timeout_secs;

        let clone = self
            .agent_command(handle, &checkout.clone_command(), timeout)
            .await?;
        if !clone.success() {
            return Err(StageError::AgentExecution(format!(
                "git clone failed: {}",
                clone.error_tail(ERROR_TAIL_CHARS)
            )));
        }

        let branch = self
            .agent_command(handle, &checkout.create_branch_command(), timeout)
            .await?;
        if !branch.success() {
            if !RepoCheckout::is_branch_exists_error(&branch.stderr) {
                return Err(StageError::AgentExecution(format!(
                    "git checkout -b {} failed: {}",
                    checkout.branch,
                    branch.error_tail(ERROR_TAIL_CHARS)
                )));
            }
            debug!(run_id = %spec.run_id, fork = spec.fork_number, branch = %checkout.branch, "Branch already exists, switching to it");
            let switch = self
                .agent_command(handle, &checkout.switch_branch_command(), timeout)
                .await?;
            if !switch.success() {
                return Err(StageError::AgentExecution(format!(
                    "git checkout {} failed: {}",
                    checkout.branch,
                    switch.error_tail(ERROR_TAIL_CHARS)
                )));
            }
        }

        let output = self.agent_command(handle, agent_command, timeout).await?;
        let parsed = self.runner.parse_usage(&output.stdout);
        usage.accumulate(&parsed);

        if output.success() {
            Ok(())
        } else {
            Err(StageError::AgentExecution(format!(
                "agent exited with code {}: {}",
                output.exit_code,
                output.error_tail(ERROR_TAIL_CHARS)
            )))
        }
    }

    async fn agent_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout_secs: u64,
    ) -> std::result::Result<CommandOutput, StageError> {
        self.backend
            .run_command(handle, command, timeout_secs)
            .await
            .map_err(|e| match e {
                SandboxError::Timeout { .. } => StageError::AgentTimeout(timeout_secs),
                SandboxError::NotFound(id) => StageError::NotFound(id),
                other => StageError::AgentExecution(other.to_string()),
            })
    }

    /// Persists the fork's cumulative agent usage on its record and in the
    /// journal. Failures are logged only.
    async fn record_usage(&self, spec: &ForkSpec, usage: &AgentUsage) {
        if !usage.parsed {
            return;
        }
        let recorded = *usage;
        if self
            .update_record(spec, move |record| record.record_usage(&recorded))
            .await
        {
            self.journal_complete(spec, Stage::RecordMetrics, usage)
                .await;
        }
    }

    /// Kills the fork's sandbox and releases its lease.
    ///
    /// Returns false if the sandbox could not be killed; the lease is then
    /// kept so the sweeper can retry later.
    async fn cleanup(
        &self,
        spec: &ForkSpec,
        sandbox_id: &str,
        attempts: &mut StageAttempts,
    ) -> bool {
        if self.journal_output::<bool>(spec, Stage::Cleanup).await.is_some() {
            debug!(run_id = %spec.run_id, fork = spec.fork_number, sandbox_id = %sandbox_id, "Cleanup already journaled");
            self.release_lease(sandbox_id).await;
            return true;
        }

        let policy = self.settings.cleanup_policy;
        let mut backoff = policy.backoff();
        let mut made = 0;

        loop {
            made += 1;
            attempts.cleanup += 1;
            self.journal_begin(spec, Stage::Cleanup).await;

            match self.backend.kill(sandbox_id).await {
                Ok(()) => {
                    info!(run_id = %spec.run_id, fork = spec.fork_number, sandbox_id = %sandbox_id, "Sandbox killed");
                }
                Err(SandboxError::NotFound(_)) => {
                    debug!(run_id = %spec.run_id, fork = spec.fork_number, sandbox_id = %sandbox_id, "Sandbox already gone");
                }
                Err(e) if policy.allows_another(made) => {
                    let delay = backoff.current();
                    backoff.next();
                    warn!(
                        sandbox_id = %sandbox_id,
                        attempt = made,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sandbox kill failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(
                        run_id = %spec.run_id,
                        fork = spec.fork_number,
                        sandbox_id = %sandbox_id,
                        attempts = made,
                        error = %e,
                        "Sandbox cleanup failed; leaving lease for the sweeper"
                    );
                    return false;
                }
            }

            self.journal_complete(spec, Stage::Cleanup, &true).await;
            self.release_lease(sandbox_id).await;
            return true;
        }
    }

    async fn release_lease(&self, sandbox_id: &str) {
        if let Err(e) = self.store.delete_lease(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, error = %e, "Failed to delete sandbox lease");
        }
    }

    /// Decides whether a failed attempt is retried; sleeps through the backoff if so.
    #[allow(clippy::too_many_arguments)]
    async fn pause_before_retry(
        &self,
        spec: &ForkSpec,
        stage: Stage,
        policy: RetryPolicy,
        backoff: &mut ExponentialBackoff,
        attempt: u32,
        error: StageError,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StageError> {
        if !error.is_retryable() || !policy.allows_another(attempt) {
            warn!(
                run_id = %spec.run_id,
                fork = spec.fork_number,
                stage = %stage,
                attempt,
                error = %error,
                "Stage failed"
            );
            return Err(error);
        }

        let delay = backoff.current();
        backoff.next();
        warn!(
            run_id = %spec.run_id,
            fork = spec.fork_number,
            stage = %stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Stage failed, retrying"
        );
        cancellable(cancel, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Loads, mutates and saves this fork's record. Returns false on failure.
    async fn update_record<F>(&self, spec: &ForkSpec, apply: F) -> bool
    where
        F: FnOnce(&mut ForkRecord) -> Result<()> + Send,
    {
        let result = async {
            let mut record = self
                .store
                .load_fork(&spec.run_id, spec.fork_number)
                .await?
                .unwrap_or_else(|| ForkRecord::new(spec.run_id.clone(), spec.fork_number));
            apply(&mut record)?;
            self.store.save_fork(&record).await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %spec.run_id, fork = spec.fork_number, error = %e, "Failed to update fork record");
                false
            }
        }
    }

    async fn journal_output<T: serde::de::DeserializeOwned>(
        &self,
        spec: &ForkSpec,
        stage: Stage,
    ) -> Option<T> {
        match self
            .journal
            .completed(&spec.run_id, spec.fork_number, stage)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(run_id = %spec.run_id, fork = spec.fork_number, stage = %stage, error = %e, "Unreadable journal entry");
                None
            }
        }
    }

    async fn journal_begin(&self, spec: &ForkSpec, stage: Stage) {
        if let Err(e) = self
            .journal
            .begin(&spec.run_id, spec.fork_number, stage)
            .await
        {
            warn!(run_id = %spec.run_id, fork = spec.fork_number, stage = %stage, error = %e, "Failed to journal step start");
        }
    }

    async fn journal_complete<T: serde::Serialize + Sync>(
        &self,
        spec: &ForkSpec,
        stage: Stage,
        output: &T,
    ) {
        if let Err(e) = self
            .journal
            .complete(&spec.run_id, spec.fork_number, stage, output)
            .await
        {
            warn!(run_id = %spec.run_id, fork = spec.fork_number, stage = %stage, error = %e, "Failed to journal step output");
        }
    }
}

/// Fails with `BudgetExceeded` once the run's reported cost reaches its limit.
fn check_budget(
    spec: &ForkSpec,
    spent: &watch::Receiver<f64>,
) -> std::result::Result<(), StageError> {
    if let Some(limit) = spec.budget_limit_usd {
        let spent = *spent.borrow();
        if spent >= limit {
            return Err(StageError::BudgetExceeded { spent, limit });
        }
    }
    Ok(())
}

fn provisioning_error(error: SandboxError) -> StageError {
    match error {
        SandboxError::Provisioning { message, retryable } => {
            StageError::Provisioning { message, retryable }
        }
        other => StageError::Provisioning {
            message: other.to_string(),
            retryable: true,
        },
    }
}

/// Races `future` against the fork's cancellation token.
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = std::result::Result<T, StageError>>,
) -> std::result::Result<T, StageError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::OrchestrationRequest;

    fn spec(limit: Option<f64>) -> ForkSpec {
        ForkSpec {
            run_id: "r1".to_string(),
            fork_number: 1,
            repo_url: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            prompt: "go".to_string(),
            model: "sonnet".to_string(),
            timeout_secs: 60,
            budget_limit_usd: limit,
        }
    }

    #[test]
    fn spec_is_derived_from_run_request() {
        let request = OrchestrationRequest::new("https://example.com/repo.git", "dev", "go", 3)
            .with_model("opus")
            .with_timeout_seconds(0)
            .with_budget_limit_usd(4.0);
        let run = OrchestrationRun::new("r9", request);

        let spec = ForkSpec::for_run(&run, 2);
        assert_eq!(spec.run_id, "r9");
        assert_eq!(spec.fork_number, 2);
        assert_eq!(spec.branch, "dev");
        assert_eq!(spec.model, "opus");
        assert_eq!(spec.timeout_secs, 1);
        assert_eq!(spec.budget_limit_usd, Some(4.0));
    }

    #[test]
    fn budget_check_trips_at_the_limit() {
        let (tx, rx) = watch::channel(1.5);
        assert!(check_budget(&spec(Some(2.0)), &rx).is_ok());
        assert!(check_budget(&spec(None), &rx).is_ok());

        tx.send(2.0).unwrap();
        assert_eq!(
            check_budget(&spec(Some(2.0)), &rx),
            Err(StageError::BudgetExceeded {
                spent: 2.0,
                limit: 2.0
            })
        );
    }

    #[test]
    fn non_provisioning_backend_errors_are_retryable() {
        let error = provisioning_error(SandboxError::Backend("503".to_string()));
        assert!(error.is_retryable());

        let error = provisioning_error(SandboxError::Provisioning {
            message: "invalid API key".to_string(),
            retryable: false,
        });
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_token_wins_the_race() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(
            &token,
            std::future::pending::<std::result::Result<(), StageError>>(),
        )
        .await;
        assert_eq!(result, Err(StageError::Cancelled));
    }

    #[test]
    fn default_settings_use_stage_policies() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.create_policy.max_attempts, 3);
        assert_eq!(settings.agent_policy.max_attempts, 2);
        assert_eq!(settings.cleanup_policy.max_attempts, 3);
        assert_eq!(settings.health_command, "true");
        assert_eq!(settings.health_timeout_secs, 10);
    }
}
