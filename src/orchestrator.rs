//! Public entry point: submit runs, query them, signal them, and control the
//! leaked-sandbox sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{OrchestratorConfig, Validate};
use crate::controller::{RunController, RunHandle};
use crate::error::{Error, Result};
use crate::executor::{ExecutorSettings, ForkExecutor};
use crate::fork::ForkRecord;
use crate::metrics::RunMetrics;
use crate::run::{OrchestrationRequest, OrchestrationRun, RunProgress, RunSummary};
use crate::runner::{AgentRunner, ClaudeRunner};
use crate::sandbox::SandboxBackend;
use crate::signal::RunSignal;
use crate::store::RunStore;
use crate::sweeper::{CleanupSweeper, SweepReport};

/// Default page size of [`Orchestrator::list_runs`].
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Fans requests out into sandboxed forks and tracks every run it owns.
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    executor: Arc<ForkExecutor>,
    sweeper: Arc<CleanupSweeper>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    list_limit: usize,
}

impl Orchestrator {
    /// Creates an orchestrator over explicit collaborators.
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn RunStore>,
        runner: Arc<dyn AgentRunner>,
        settings: ExecutorSettings,
    ) -> Self {
        let executor = Arc::new(ForkExecutor::new(
            backend.clone(),
            store.clone(),
            runner,
            settings,
        ));
        let sweeper = Arc::new(CleanupSweeper::new(backend, store.clone()));
        Self {
            store,
            executor,
            sweeper,
            runs: RwLock::new(HashMap::new()),
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    /// Builds an orchestrator from validated configuration, starting the
    /// sweeper if configured to.
    pub async fn from_config(
        config: &OrchestratorConfig,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Self> {
        for warning in config.validate().into_result()? {
            warn!(warning = %warning, "Configuration warning");
        }

        let store = config.store.open().await?;
        let runner = Arc::new(ClaudeRunner::with_cli_path(config.agent.cli_path.clone()));
        let orchestrator = Self::new(backend, store, runner, config.executor_settings())
            .with_list_limit(config.runs.list_limit);

        if config.sweeper.autostart {
            orchestrator
                .start_sweeper(config.sweeper.interval(), config.sweeper.max_age())
                .await;
        }
        Ok(orchestrator)
    }

    /// Sets the default page size of run listings.
    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    /// Returns the run store.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Validates and persists a run, then starts it in the background.
    ///
    /// Returns the run id as soon as the run and its pending forks are stored.
    pub async fn submit(&self, request: OrchestrationRequest) -> Result<String> {
        for warning in request.validate().into_result()? {
            warn!(warning = %warning, "Request warning");
        }

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.store.load_run(&run_id).await?.is_some() {
            return Err(Error::Config(format!("run {} already exists", run_id)));
        }

        let run = OrchestrationRun::new(run_id.clone(), request);
        let forks: Vec<ForkRecord> = (1..=run.num_forks())
            .map(|n| ForkRecord::new(run_id.clone(), n))
            .collect();
        for fork in &forks {
            self.store.save_fork(fork).await?;
        }
        self.store
            .save_metrics(&RunMetrics::new(run_id.clone(), run.num_forks()))
            .await?;
        self.store.save_run(&run).await?;

        info!(
            run_id = %run_id,
            repo = %run.request.repo_url,
            branch = %run.request.branch,
            forks = run.num_forks(),
            max_concurrent = run.request.max_concurrent,
            budget_limit_usd = ?run.request.budget_limit_usd,
            "Run submitted"
        );

        self.start_controller(run, forks, None).await;
        Ok(run_id)
    }

    async fn start_controller(
        &self,
        run: OrchestrationRun,
        forks: Vec<ForkRecord>,
        metrics: Option<RunMetrics>,
    ) {
        let run_id = run.run_id.clone();
        let handle = RunController::spawn(
            run,
            forks,
            metrics,
            self.store.clone(),
            self.executor.clone(),
        );

        let mut runs = self.runs.write().await;
        runs.retain(|_, handle| !handle.is_finished());
        runs.insert(run_id, Arc::new(handle));
    }

    /// Current progress of a run. Safe to call at any time.
    pub async fn progress(&self, run_id: &str) -> Result<RunProgress> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let forks = self.store.load_forks(run_id).await?;
        Ok(RunProgress::from_records(&run, forks))
    }

    /// Metrics aggregate of a run.
    pub async fn metrics(&self, run_id: &str) -> Result<RunMetrics> {
        self.store
            .load_metrics(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Stops admitting new forks for a run.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        self.signal(run_id, RunSignal::Pause).await
    }

    /// Re-enables admission for a paused run.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        self.signal(run_id, RunSignal::Resume).await
    }

    /// Cancels a run: pending forks never start and running forks are interrupted.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        self.signal(run_id, RunSignal::Cancel).await
    }

    /// Queues `signal` for a run. Signals to finished runs are ignored.
    pub async fn signal(&self, run_id: &str, signal: RunSignal) -> Result<()> {
        if let Some(handle) = self.runs.read().await.get(run_id) {
            if !handle.signal(signal) {
                debug!(run_id = %run_id, signal = %signal, "Run already finished; signal ignored");
            }
            return Ok(());
        }

        if self.store.load_run(run_id).await?.is_some() {
            debug!(run_id = %run_id, signal = %signal, "Run not active here; signal ignored");
            Ok(())
        } else {
            Err(Error::RunNotFound(run_id.to_string()))
        }
    }

    /// Most recent runs first, at most `limit` (or the configured page size).
    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunSummary>> {
        let mut runs = self.store.load_runs().await?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs
            .iter()
            .take(limit.unwrap_or(self.list_limit))
            .map(RunSummary::from)
            .collect())
    }

    /// Waits for a run to complete and returns its final progress.
    ///
    /// Runs that no controller in this process owns resolve immediately with
    /// their persisted progress.
    pub async fn wait(&self, run_id: &str) -> Result<RunProgress> {
        let handle = self.runs.read().await.get(run_id).cloned();
        if let Some(handle) = handle {
            handle.wait().await;
        }
        self.progress(run_id).await
    }

    /// Resumes every persisted run that never completed.
    ///
    /// Forks left `running` by a previous process are executed again; their
    /// journaled steps are reused rather than repeated.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for run in self.store.load_runs().await? {
            if run.completed_at.is_some() || self.runs.read().await.contains_key(&run.run_id) {
                continue;
            }
            let forks = self.store.load_forks(&run.run_id).await?;
            let metrics = self.store.load_metrics(&run.run_id).await?;
            info!(run_id = %run.run_id, forks = forks.len(), "Recovering run");
            recovered.push(run.run_id.clone());
            self.start_controller(run, forks, metrics).await;
        }
        Ok(recovered)
    }

    /// Starts (or restarts) the deployment-wide sweeper.
    pub async fn start_sweeper(&self, interval: Duration, max_age: Duration) {
        self.sweeper.start(interval, max_age).await;
    }

    /// Stops the sweeper. Returns false if it was not running.
    pub async fn stop_sweeper(&self) -> bool {
        self.sweeper.stop().await
    }

    /// Runs one sweep immediately.
    pub async fn sweep_now(&self, max_age: Duration) -> Result<SweepReport> {
        self.sweeper.sweep_once(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandboxBackend;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        Orchestrator::new(
            Arc::new(LocalSandboxBackend::new(Some(dir.path().to_path_buf()))),
            Arc::new(MemoryStore::new()),
            Arc::new(ClaudeRunner::new()),
            ExecutorSettings::default(),
        )
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_anything_is_stored() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let request = OrchestrationRequest::new("", "main", "go", 0);

        let err = orchestrator.submit(request).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(orchestrator.store().load_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);

        assert!(matches!(
            orchestrator.progress("nope").await,
            Err(Error::RunNotFound(_))
        ));
        assert!(matches!(
            orchestrator.cancel("nope").await,
            Err(Error::RunNotFound(_))
        ));
        assert!(matches!(
            orchestrator.metrics("nope").await,
            Err(Error::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_limit_is_never_zero() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir).with_list_limit(0);
        assert_eq!(orchestrator.list_limit, 1);
        assert!(orchestrator.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweeper_control_round_trips() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);

        assert!(!orchestrator.stop_sweeper().await);
        orchestrator
            .start_sweeper(Duration::from_millis(20), Duration::from_secs(60))
            .await;
        assert!(orchestrator.stop_sweeper().await);
    }
}
