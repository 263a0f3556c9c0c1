//! Background sweeper that kills leaked sandboxes.
//!
//! Executor cleanup can fail to run (the process dies mid-pipeline) or fail
//! outright (the backend refuses the kill three times). The sweeper is the
//! backstop: on a fixed interval it kills every sandbox whose lease no longer
//! protects it, and every sandbox the backend lists without any lease at all,
//! once it is older than the configured max age.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::run::OrchestrationRun;
use crate::sandbox::{SandboxBackend, SandboxError, SandboxId};
use crate::store::RunStore;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Leases inspected.
    pub leases_checked: usize,
    /// Sandboxes killed because their lease was orphaned.
    pub killed: Vec<SandboxId>,
    /// Sandboxes killed because the backend listed them without a lease.
    pub unleased_killed: Vec<SandboxId>,
    /// Sandboxes the backend refused to kill, with the reason.
    pub failed: Vec<(SandboxId, String)>,
}

impl SweepReport {
    /// Total sandboxes killed.
    pub fn killed_count(&self) -> usize {
        self.killed.len() + self.unleased_killed.len()
    }

    /// Returns true if the sweep changed nothing.
    pub fn is_empty(&self) -> bool {
        self.killed_count() == 0 && self.failed.is_empty()
    }
}

struct SweeperTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Deployment-wide leaked-sandbox sweeper. At most one loop runs at a time.
pub struct CleanupSweeper {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn RunStore>,
    task: Mutex<Option<SweeperTask>>,
}

impl CleanupSweeper {
    /// Creates a stopped sweeper.
    pub fn new(backend: Arc<dyn SandboxBackend>, store: Arc<dyn RunStore>) -> Self {
        Self {
            backend,
            store,
            task: Mutex::new(None),
        }
    }

    /// Starts sweeping every `interval`, killing sandboxes older than
    /// `max_age`. A loop that is already running is replaced.
    pub async fn start(self: &Arc<Self>, interval: Duration, max_age: Duration) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.token.cancel();
            debug!("Replacing running cleanup sweeper");
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let sweeper = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));

        info!(
            interval_secs = interval.as_secs_f64(),
            max_age_secs = max_age.as_secs(),
            "Starting cleanup sweeper"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match sweeper.sweep_once(max_age).await {
                            Ok(report) if !report.is_empty() => info!(
                                killed = report.killed.len(),
                                unleased_killed = report.unleased_killed.len(),
                                failed = report.failed.len(),
                                "Sweep finished"
                            ),
                            Ok(_) => debug!("Sweep found nothing to clean"),
                            Err(e) => warn!(error = %e, "Sweep failed"),
                        }
                    }
                }
            }
            info!("Cleanup sweeper stopped");
        });

        *task = Some(SweeperTask { token, handle });
    }

    /// Stops the sweeper loop. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(task) = self.task.lock().await.take() else {
            return false;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Cleanup sweeper task ended abnormally");
        }
        true
    }

    /// Returns true while the sweeper loop is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Runs a single sweep.
    pub async fn sweep_once(&self, max_age: Duration) -> Result<SweepReport> {
        let now = Utc::now();
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut report = SweepReport::default();

        let leases = self.store.load_leases().await?;
        report.leases_checked = leases.len();
        let leased: HashSet<SandboxId> = leases
            .iter()
            .map(|lease| lease.sandbox_id.clone())
            .collect();

        let mut runs: HashMap<String, Option<OrchestrationRun>> = HashMap::new();
        for lease in &leases {
            if !runs.contains_key(&lease.run_id) {
                let run = self.store.load_run(&lease.run_id).await?;
                runs.insert(lease.run_id.clone(), run);
            }
            let run = runs.get(&lease.run_id).and_then(Option::as_ref);
            if !lease.is_orphaned(run, now, max_age) {
                continue;
            }

            match self.kill(&lease.sandbox_id).await {
                Ok(()) => {
                    info!(
                        sandbox_id = %lease.sandbox_id,
                        run_id = %lease.run_id,
                        fork = lease.fork_number,
                        "Swept orphaned sandbox"
                    );
                    self.store.delete_lease(&lease.sandbox_id).await?;
                    report.killed.push(lease.sandbox_id.clone());
                }
                Err(e) => {
                    warn!(sandbox_id = %lease.sandbox_id, error = %e, "Failed to sweep sandbox");
                    report.failed.push((lease.sandbox_id.clone(), e.to_string()));
                }
            }
        }

        let listed = match self.backend.list_sandboxes().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Failed to list sandboxes");
                return Ok(report);
            }
        };
        for sandbox in listed {
            if leased.contains(&sandbox.id) || now - sandbox.created_at <= max_age {
                continue;
            }
            match self.kill(&sandbox.id).await {
                Ok(()) => {
                    info!(sandbox_id = %sandbox.id, "Swept unleased sandbox");
                    report.unleased_killed.push(sandbox.id);
                }
                Err(e) => {
                    warn!(sandbox_id = %sandbox.id, error = %e, "Failed to sweep unleased sandbox");
                    report.failed.push((sandbox.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Kills a sandbox, treating "already gone" as success.
    async fn kill(&self, sandbox_id: &str) -> std::result::Result<(), SandboxError> {
        match self.backend.kill(sandbox_id).await {
            Err(SandboxError::NotFound(_)) => {
                debug!(sandbox_id = %sandbox_id, "Sandbox already gone");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::SandboxLease;
    use crate::run::OrchestrationRequest;
    use crate::sandbox::{LocalSandboxBackend, SandboxRequest};
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<LocalSandboxBackend>, Arc<MemoryStore>, CleanupSweeper) {
        let dir = TempDir::new().expect("failed to create sandbox root");
        let backend = Arc::new(LocalSandboxBackend::new(Some(dir.path().to_path_buf())));
        let store = Arc::new(MemoryStore::new());
        let sweeper = CleanupSweeper::new(backend.clone(), store.clone());
        (dir, backend, store, sweeper)
    }

    fn aged_lease(sandbox_id: &str, run_id: &str, hours: i64) -> SandboxLease {
        SandboxLease {
            created_at: Utc::now() - chrono::Duration::hours(hours),
            ..SandboxLease::new(sandbox_id, run_id, 1)
        }
    }

    #[tokio::test]
    async fn sweeps_old_lease_of_unknown_run() {
        let (_dir, backend, store, sweeper) = setup();
        let id = backend
            .create(&SandboxRequest::new("base", 600))
            .await
            .unwrap();
        store.save_lease(&aged_lease(&id, "gone", 2)).await.unwrap();

        let report = sweeper
            .sweep_once(Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(report.leases_checked, 1);
        assert_eq!(report.killed, vec![id.clone()]);
        assert!(store.load_leases().await.unwrap().is_empty());
        assert!(backend.connect(&id).await.is_err());
    }

    #[tokio::test]
    async fn leaves_sandboxes_of_live_runs_alone() {
        let (_dir, backend, store, sweeper) = setup();
        let id = backend
            .create(&SandboxRequest::new("base", 600))
            .await
            .unwrap();
        let request = OrchestrationRequest::new("https://example.com/repo.git", "main", "go", 1);
        store
            .save_run(&OrchestrationRun::new("live", request))
            .await
            .unwrap();
        store.save_lease(&aged_lease(&id, "live", 5)).await.unwrap();

        let report = sweeper
            .sweep_once(Duration::from_secs(60))
            .await
            .unwrap();

        assert!(report.is_empty());
        assert!(backend.connect(&id).await.is_ok());
    }

    #[tokio::test]
    async fn already_gone_sandbox_counts_as_swept() {
        let (_dir, _backend, store, sweeper) = setup();
        store
            .save_lease(&aged_lease("sbx-vanished", "gone", 3))
            .await
            .unwrap();

        let report = sweeper
            .sweep_once(Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(report.killed, vec!["sbx-vanished".to_string()]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn sweeps_unleased_sandboxes_past_max_age() {
        let (_dir, backend, _store, sweeper) = setup();
        let id = backend
            .create(&SandboxRequest::new("base", 600))
            .await
            .unwrap();

        let young = sweeper
            .sweep_once(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(young.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = sweeper
            .sweep_once(Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(report.unleased_killed, vec![id]);
    }

    #[tokio::test]
    async fn start_and_stop_are_singleton() {
        let (_dir, _backend, _store, sweeper) = setup();
        let sweeper = Arc::new(sweeper);

        assert!(!sweeper.stop().await);
        sweeper
            .start(Duration::from_millis(10), Duration::from_secs(60))
            .await;
        sweeper
            .start(Duration::from_millis(10), Duration::from_secs(60))
            .await;
        assert!(sweeper.is_running().await);

        assert!(sweeper.stop().await);
        assert!(!sweeper.is_running().await);
    }
}
