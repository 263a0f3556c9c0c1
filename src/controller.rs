//! Run-level scheduler.
//!
//! One controller task owns each run. It is the only writer of the run's
//! aggregates: executors report terminal outcomes over a channel, and
//! admission, budget enforcement and signal handling all happen inside the
//! controller's single loop, so concurrent completions never race on the
//! running count or total cost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ForkExecutor, ForkSpec};
use crate::fork::{ForkOutcome, ForkRecord, ForkStatus};
use crate::metrics::RunMetrics;
use crate::run::{OrchestrationRun, StatusCounts};
use crate::signal::RunSignal;
use crate::store::RunStore;

/// Messages processed by the controller loop.
#[derive(Debug)]
enum RunEvent {
    ForkFinished(ForkOutcome),
    Signal(RunSignal),
}

/// Handle to a running controller.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    events: mpsc::UnboundedSender<RunEvent>,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Run this handle controls.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Queues a signal for the controller. Returns false if the run has
    /// already finished.
    pub fn signal(&self, signal: RunSignal) -> bool {
        self.events.send(RunEvent::Signal(signal)).is_ok()
    }

    /// Returns true once every fork is terminal.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow() || self.task.is_finished()
    }

    /// Resolves once every fork is terminal.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Single-loop owner of one run's aggregate state.
pub struct RunController {
    run: OrchestrationRun,
    statuses: BTreeMap<u32, ForkStatus>,
    running: HashMap<u32, CancellationToken>,
    metrics: RunMetrics,
    store: Arc<dyn RunStore>,
    executor: Arc<ForkExecutor>,
    run_token: CancellationToken,
    events_tx: mpsc::UnboundedSender<RunEvent>,
    events_rx: mpsc::UnboundedReceiver<RunEvent>,
    spent_tx: watch::Sender<f64>,
    done_tx: watch::Sender<bool>,
}

impl RunController {
    /// Starts the controller for `run` on a new task.
    ///
    /// `forks` holds whatever fork records already exist; missing fork numbers
    /// start out pending. Forks recorded as `running` (left over from a
    /// previous process) are dispatched again before the first admission pass.
    pub fn spawn(
        mut run: OrchestrationRun,
        forks: Vec<ForkRecord>,
        metrics: Option<RunMetrics>,
        store: Arc<dyn RunStore>,
        executor: Arc<ForkExecutor>,
    ) -> RunHandle {
        let run_id = run.run_id.clone();
        let mut statuses: BTreeMap<u32, ForkStatus> = (1..=run.num_forks())
            .map(|n| (n, ForkStatus::Pending))
            .collect();
        // Aggregates are rebuilt from the fork records, which are written
        // before the run record and so are never behind it.
        let mut counts = StatusCounts::default();
        let mut total_cost_usd = 0.0;
        for fork in &forks {
            if let Some(status) = statuses.get_mut(&fork.fork_number) {
                *status = fork.status;
                if fork.is_terminal() {
                    counts.record(fork.status);
                    total_cost_usd += fork.cost_usd.max(0.0);
                }
            }
        }
        run.counts = counts;
        run.total_cost_usd = total_cost_usd;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (spent_tx, _) = watch::channel(run.total_cost_usd);
        let (done_tx, done_rx) = watch::channel(false);
        let metrics = metrics.unwrap_or_else(|| RunMetrics::new(run_id.clone(), run.num_forks()));

        let controller = Self {
            run,
            statuses,
            running: HashMap::new(),
            metrics,
            store,
            executor,
            run_token: CancellationToken::new(),
            events_tx: events_tx.clone(),
            events_rx,
            spent_tx,
            done_tx,
        };
        let task = tokio::spawn(controller.run_loop());

        RunHandle {
            run_id,
            events: events_tx,
            done: done_rx,
            task,
        }
    }

    async fn run_loop(mut self) {
        let orphaned: Vec<u32> = self
            .statuses
            .iter()
            .filter(|(_, status)| **status == ForkStatus::Running)
            .map(|(n, _)| *n)
            .collect();
        for fork_number in orphaned {
            info!(run_id = %self.run.run_id, fork = fork_number, "Re-dispatching fork left running");
            self.dispatch(fork_number);
        }

        self.admit().await;
        self.persist().await;

        while !self.run.all_forks_terminal() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            match event {
                RunEvent::ForkFinished(outcome) => self.on_fork_finished(outcome).await,
                RunEvent::Signal(signal) => self.on_signal(signal).await,
            }
            self.admit().await;
            self.persist().await;
        }

        self.complete().await;
    }

    fn pending(&self) -> Vec<u32> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == ForkStatus::Pending)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Admits pending forks in ascending order while capacity allows.
    async fn admit(&mut self) {
        if self.run.cancelled {
            return;
        }
        if self.run.budget_exhausted() {
            self.short_circuit_pending(ForkStatus::BudgetExceeded).await;
            return;
        }
        if self.run.paused {
            return;
        }

        let capacity = self.run.request.max_concurrent.max(1) as usize;
        for fork_number in self.pending() {
            if self.running.len() >= capacity {
                break;
            }
            self.launch(fork_number).await;
        }
    }

    async fn launch(&mut self, fork_number: u32) {
        let mut record = self.load_record(fork_number).await;
        match record.transition(ForkStatus::Running) {
            Ok(()) => {
                if let Err(e) = self.store.save_fork(&record).await {
                    warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Failed to persist admitted fork");
                }
            }
            Err(e) => {
                warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Fork record out of step with controller");
            }
        }

        self.statuses.insert(fork_number, ForkStatus::Running);
        info!(
            run_id = %self.run.run_id,
            fork = fork_number,
            running = self.running.len() + 1,
            max_concurrent = self.run.request.max_concurrent,
            "Fork admitted"
        );
        self.dispatch(fork_number);
    }

    /// Runs the executor for `fork_number` on its own task.
    fn dispatch(&mut self, fork_number: u32) {
        let token = self.run_token.child_token();
        self.running.insert(fork_number, token.clone());

        let spec = ForkSpec::for_run(&self.run, fork_number);
        let run_id = self.run.run_id.clone();
        let executor = self.executor.clone();
        let spent = self.spent_tx.subscribe();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let execution =
                tokio::spawn(async move { executor.execute(&spec, token, spent).await });
            let outcome = match execution.await {
                Ok(outcome) => outcome,
                Err(e) => ForkOutcome::short_circuit(
                    run_id,
                    fork_number,
                    ForkStatus::Failed,
                    Some(format!("fork executor aborted: {}", e)),
                ),
            };
            // The controller only stops once every fork has reported.
            let _ = events.send(RunEvent::ForkFinished(outcome));
        });
    }

    async fn on_fork_finished(&mut self, outcome: ForkOutcome) {
        let fork_number = outcome.fork_number;
        self.running.remove(&fork_number);

        if self
            .statuses
            .get(&fork_number)
            .map(|status| status.is_terminal())
            .unwrap_or(true)
        {
            warn!(run_id = %self.run.run_id, fork = fork_number, "Ignoring outcome for terminal or unknown fork");
            return;
        }

        let mut record = self.load_record(fork_number).await;
        if record.status == ForkStatus::Pending {
            // Admission write was lost; replay it so the state machine holds.
            if let Err(e) = record.transition(ForkStatus::Running) {
                warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Failed to replay fork admission");
            }
        }
        match record.finish(&outcome) {
            Ok(()) => {
                if let Err(e) = self.store.save_fork(&record).await {
                    warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Failed to persist fork outcome");
                }
            }
            Err(e) => {
                warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Fork record rejected outcome");
            }
        }

        self.statuses.insert(fork_number, outcome.status);
        self.run.record_terminal(outcome.status, outcome.cost_usd);
        self.metrics.record(&outcome);
        self.spent_tx.send_replace(self.run.total_cost_usd);

        info!(
            run_id = %self.run.run_id,
            fork = fork_number,
            status = %outcome.status,
            cost_usd = outcome.cost_usd,
            total_cost_usd = self.run.total_cost_usd,
            completed = self.run.completed_count(),
            failed = self.run.failed_count(),
            "Fork finished"
        );
    }

    async fn on_signal(&mut self, signal: RunSignal) {
        info!(run_id = %self.run.run_id, signal = %signal, "Signal received");
        match signal {
            RunSignal::Pause => self.run.paused = true,
            RunSignal::Resume => self.run.paused = false,
            RunSignal::Cancel => {
                if self.run.cancelled {
                    debug!(run_id = %self.run.run_id, "Run already cancelled");
                    return;
                }
                self.run.cancelled = true;
                self.run_token.cancel();
                self.short_circuit_pending(ForkStatus::Cancelled).await;
            }
        }
    }

    /// Moves every pending fork straight to `status` without provisioning.
    async fn short_circuit_pending(&mut self, status: ForkStatus) {
        let pending = self.pending();
        if pending.is_empty() {
            return;
        }

        for fork_number in &pending {
            let fork_number = *fork_number;
            let outcome =
                ForkOutcome::short_circuit(self.run.run_id.clone(), fork_number, status, None);
            let mut record = self.load_record(fork_number).await;
            match record.finish(&outcome) {
                Ok(()) => {
                    if let Err(e) = self.store.save_fork(&record).await {
                        warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Failed to persist short-circuited fork");
                    }
                }
                Err(e) => {
                    warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Fork record rejected short-circuit");
                }
            }
            self.statuses.insert(fork_number, status);
            self.run.record_terminal(status, 0.0);
            self.metrics.record_skipped();
        }

        info!(
            run_id = %self.run.run_id,
            status = %status,
            forks = pending.len(),
            total_cost_usd = self.run.total_cost_usd,
            "Pending forks short-circuited"
        );
    }

    async fn load_record(&self, fork_number: u32) -> ForkRecord {
        match self.store.load_fork(&self.run.run_id, fork_number).await {
            Ok(Some(record)) => record,
            Ok(None) => ForkRecord::new(self.run.run_id.clone(), fork_number),
            Err(e) => {
                warn!(run_id = %self.run.run_id, fork = fork_number, error = %e, "Failed to load fork record");
                let mut record = ForkRecord::new(self.run.run_id.clone(), fork_number);
                record.status = self
                    .statuses
                    .get(&fork_number)
                    .copied()
                    .unwrap_or(ForkStatus::Pending);
                record
            }
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save_run(&self.run).await {
            warn!(run_id = %self.run.run_id, error = %e, "Failed to persist run");
        }
        if let Err(e) = self.store.save_metrics(&self.metrics).await {
            warn!(run_id = %self.run.run_id, error = %e, "Failed to persist run metrics");
        }
    }

    async fn complete(&mut self) {
        if self.run.completed_at.is_none() {
            self.run.completed_at = Some(Utc::now());
        }
        self.persist().await;
        info!(
            run_id = %self.run.run_id,
            completed = self.run.completed_count(),
            failed = self.run.failed_count(),
            total_cost_usd = self.run.total_cost_usd,
            cancelled = self.run.cancelled,
            "Run completed"
        );
        self.done_tx.send_replace(true);
    }
}
