//! Single-fork pipeline behavior, driven without a run controller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use common::{eventually, fast_settings, ScriptedBackend};
use fork_orchestrator::{
    ClaudeRunner, ForkExecutor, ForkSpec, ForkStatus, MemoryStore, RunStore, Stage, StepJournal,
};

fn spec(budget_limit_usd: Option<f64>) -> ForkSpec {
    ForkSpec {
        run_id: "run-x".to_string(),
        fork_number: 1,
        repo_url: "https://example.com/acme/widgets.git".to_string(),
        branch: "feature".to_string(),
        prompt: "Add a changelog entry".to_string(),
        model: String::new(),
        timeout_secs: 30,
        budget_limit_usd,
    }
}

fn executor(backend: Arc<ScriptedBackend>) -> (ForkExecutor, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let executor = ForkExecutor::new(
        backend,
        store.clone(),
        Arc::new(ClaudeRunner::new()),
        fast_settings(),
    );
    (executor, store)
}

#[tokio::test]
async fn successful_fork_reports_usage_and_releases_its_lease() {
    let backend = Arc::new(ScriptedBackend::new().with_cost(0.4));
    let (executor, store) = executor(backend.clone());
    let (_spent_tx, spent) = watch::channel(0.0);

    let outcome = executor
        .execute(&spec(None), CancellationToken::new(), spent)
        .await;

    assert_eq!(outcome.status, ForkStatus::Success);
    assert!((outcome.cost_usd - 0.4).abs() < 1e-9);
    assert_eq!(outcome.input_tokens, 100);
    assert_eq!(outcome.output_tokens, 20);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.attempts.create, 1);
    assert_eq!(outcome.attempts.agent, 1);
    assert_eq!(outcome.attempts.cleanup, 1);

    let sandbox_id = outcome.sandbox_id.clone().unwrap();
    assert_eq!(backend.kill_calls(&sandbox_id), 1);
    assert!(store.load_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn executor_leaves_terminal_status_to_the_caller() {
    let backend = Arc::new(ScriptedBackend::new().with_cost(1.0));
    let (executor, store) = executor(backend);
    let (_spent_tx, spent) = watch::channel(0.0);

    let outcome = executor
        .execute(&spec(None), CancellationToken::new(), spent)
        .await;

    let record = store.load_fork("run-x", 1).await.unwrap().unwrap();
    assert!(!record.is_terminal());
    assert_eq!(record.sandbox_id, outcome.sandbox_id);
    assert!((record.cost_usd - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn completed_steps_are_journaled() {
    let backend = Arc::new(ScriptedBackend::new());
    let (executor, store) = executor(backend);
    let (_spent_tx, spent) = watch::channel(0.0);

    let outcome = executor
        .execute(&spec(None), CancellationToken::new(), spent)
        .await;

    let journal = StepJournal::new(store);
    let sandbox: Option<String> = journal
        .completed("run-x", 1, Stage::CreateSandbox)
        .await
        .unwrap();
    assert_eq!(sandbox, outcome.sandbox_id);

    for stage in [
        Stage::HealthCheck,
        Stage::RunAgent,
        Stage::RecordMetrics,
        Stage::Cleanup,
    ] {
        let step = journal.record("run-x", 1, stage).await.unwrap().unwrap();
        assert_eq!(step.attempts, 1, "{} attempts", stage);
        assert!(step.completed_at.is_some(), "{} completed", stage);
    }
}

#[tokio::test]
async fn exhausted_budget_skips_provisioning() {
    let backend = Arc::new(ScriptedBackend::new());
    let (executor, _store) = executor(backend.clone());
    let (_spent_tx, spent) = watch::channel(2.0);

    let outcome = executor
        .execute(&spec(Some(2.0)), CancellationToken::new(), spent)
        .await;

    assert_eq!(outcome.status, ForkStatus::BudgetExceeded);
    assert!(outcome.sandbox_id.is_none());
    assert_eq!(outcome.cost_usd, 0.0);
    assert_eq!(backend.create_calls(), 0);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let backend = Arc::new(ScriptedBackend::new());
    let (executor, _store) = executor(backend.clone());
    let (_spent_tx, spent) = watch::channel(0.0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = executor.execute(&spec(None), cancel, spent).await;

    assert_eq!(outcome.status, ForkStatus::Cancelled);
    assert_eq!(backend.create_calls(), 0);
    assert_eq!(backend.total_kill_calls(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_the_agent_and_still_cleans_up() {
    let backend = Arc::new(ScriptedBackend::new().with_agent_delay(Duration::from_secs(30)));
    let (executor, store) = executor(backend.clone());
    let executor = Arc::new(executor);
    let (_spent_tx, spent) = watch::channel(0.0);
    let cancel = CancellationToken::new();

    let task = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.execute(&spec(None), cancel, spent).await })
    };

    let watched = backend.clone();
    eventually(move || watched.agents_running() == 1).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ForkStatus::Cancelled);
    assert_eq!(outcome.attempts.agent, 1);
    assert_eq!(backend.agents_running(), 0);
    assert_eq!(backend.alive_count(), 0);
    assert_eq!(
        backend.kill_calls(outcome.sandbox_id.as_deref().unwrap()),
        1
    );
    assert!(store.load_leases().await.unwrap().is_empty());
}
