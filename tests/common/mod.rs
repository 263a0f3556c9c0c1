//! Shared fixtures for integration tests: a scripted in-memory sandbox
//! backend and helpers for building orchestrators over it.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fork_orchestrator::{
    ClaudeRunner, CommandOutput, ExecutorSettings, MemoryStore, OrchestrationRequest,
    Orchestrator, RetryPolicy, RunProgress, SandboxBackend, SandboxError, SandboxHandle,
    SandboxId, SandboxInfo, SandboxRequest,
};

/// Agent stdout ending in a stream-json result line.
pub fn result_line(cost: f64) -> String {
    format!(
        "{{\"type\":\"assistant\",\"message\":\"working\"}}\n{{\"type\":\"result\",\"total_cost_usd\":{},\"usage\":{{\"input_tokens\":100,\"output_tokens\":20}}}}\n",
        cost
    )
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    alive: HashMap<SandboxId, DateTime<Utc>>,
    created: Vec<SandboxId>,
    create_calls: u32,
    create_failures: VecDeque<SandboxError>,
    kill_calls: HashMap<SandboxId, u32>,
    kill_failures: u32,
    agent_runs: u32,
    agents_running: u32,
    max_agents_running: u32,
    max_alive: usize,
    agent_exit_codes: VecDeque<i32>,
}

/// Scripted sandbox backend that records every call.
pub struct ScriptedBackend {
    state: Mutex<State>,
    cost: f64,
    agent_stdout: Option<String>,
    agent_delay: Duration,
    health_exit_code: i32,
    branch_exists: bool,
}

/// Decrements the running-agent gauge even when the command future is dropped.
struct AgentGauge<'a>(&'a Mutex<State>);

impl Drop for AgentGauge<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap();
        state.agents_running -= 1;
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cost: 1.0,
            agent_stdout: None,
            agent_delay: Duration::from_millis(10),
            health_exit_code: 0,
            branch_exists: false,
        }
    }

    /// Cost reported by every agent run.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Replaces the agent's stdout entirely.
    pub fn with_agent_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.agent_stdout = Some(stdout.into());
        self
    }

    pub fn with_agent_delay(mut self, delay: Duration) -> Self {
        self.agent_delay = delay;
        self
    }

    pub fn with_health_exit_code(mut self, code: i32) -> Self {
        self.health_exit_code = code;
        self
    }

    /// Makes `git checkout -b` report that the branch already exists.
    pub fn with_existing_branch(mut self) -> Self {
        self.branch_exists = true;
        self
    }

    /// Queues failures returned by the next `create` calls.
    pub fn fail_creates(self, count: usize, retryable: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for i in 0..count {
                state.create_failures.push_back(SandboxError::Provisioning {
                    message: format!("scripted failure {}", i + 1),
                    retryable,
                });
            }
        }
        self
    }

    /// Queues exit codes for the next agent runs; unscripted runs exit 0.
    pub fn with_agent_exit_codes(self, codes: &[i32]) -> Self {
        self.state
            .lock()
            .unwrap()
            .agent_exit_codes
            .extend(codes.iter().copied());
        self
    }

    /// Makes the next `count` kills fail.
    pub fn fail_kills(self, count: u32) -> Self {
        self.set_kill_failures(count);
        self
    }

    pub fn set_kill_failures(&self, count: u32) {
        self.state.lock().unwrap().kill_failures = count;
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn created(&self) -> Vec<SandboxId> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn kill_calls(&self, sandbox_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .kill_calls
            .get(sandbox_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_kill_calls(&self) -> u32 {
        self.state.lock().unwrap().kill_calls.values().sum()
    }

    pub fn alive_count(&self) -> usize {
        self.state.lock().unwrap().alive.len()
    }

    pub fn max_alive(&self) -> usize {
        self.state.lock().unwrap().max_alive
    }

    pub fn agent_runs(&self) -> u32 {
        self.state.lock().unwrap().agent_runs
    }

    pub fn agents_running(&self) -> u32 {
        self.state.lock().unwrap().agents_running
    }

    pub fn max_agents_running(&self) -> u32 {
        self.state.lock().unwrap().max_agents_running
    }

    /// Inserts a live sandbox without counting a `create` call.
    pub fn adopt(&self, sandbox_id: &str, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(sandbox_id.to_string(), created_at);
    }

    pub fn is_alive(&self, sandbox_id: &str) -> bool {
        self.state.lock().unwrap().alive.contains_key(sandbox_id)
    }

    fn ensure_alive(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if self.is_alive(sandbox_id) {
            Ok(())
        } else {
            Err(SandboxError::NotFound(sandbox_id.to_string()))
        }
    }

    async fn run_agent(&self, timeout_secs: u64) -> Result<CommandOutput, SandboxError> {
        let exit_code = {
            let mut state = self.state.lock().unwrap();
            state.agent_runs += 1;
            state.agents_running += 1;
            state.max_agents_running = state.max_agents_running.max(state.agents_running);
            state.agent_exit_codes.pop_front().unwrap_or(0)
        };
        let _gauge = AgentGauge(&self.state);

        if tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::time::sleep(self.agent_delay),
        )
        .await
        .is_err()
        {
            return Err(SandboxError::Timeout {
                seconds: timeout_secs,
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout: self
                .agent_stdout
                .clone()
                .unwrap_or_else(|| result_line(self.cost)),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "agent crashed".to_string()
            },
        })
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn create(&self, _request: &SandboxRequest) -> Result<SandboxId, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let id = format!("sbx-{}", state.next_id);
        state.alive.insert(id.clone(), Utc::now());
        state.created.push(id.clone());
        state.max_alive = state.max_alive.max(state.alive.len());
        Ok(id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
        self.ensure_alive(sandbox_id)?;
        Ok(SandboxHandle::new(sandbox_id))
    }

    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, SandboxError> {
        Ok(self.is_alive(&handle.id))
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout_secs: u64,
    ) -> Result<CommandOutput, SandboxError> {
        self.ensure_alive(&handle.id)?;

        if command == "true" {
            return Ok(CommandOutput {
                exit_code: self.health_exit_code,
                stdout: String::new(),
                stderr: if self.health_exit_code == 0 {
                    String::new()
                } else {
                    "sandbox unresponsive".to_string()
                },
            });
        }
        if command.contains("git clone") {
            return Ok(CommandOutput::default());
        }
        if command.contains("git checkout -b") {
            if self.branch_exists {
                return Ok(CommandOutput {
                    exit_code: 128,
                    stdout: String::new(),
                    stderr: "fatal: a branch named 'main' already exists".to_string(),
                });
            }
            return Ok(CommandOutput::default());
        }
        if command.contains("git checkout") {
            return Ok(CommandOutput::default());
        }

        self.run_agent(timeout_secs).await
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        *state.kill_calls.entry(sandbox_id.to_string()).or_insert(0) += 1;
        if state.kill_failures > 0 {
            state.kill_failures -= 1;
            return Err(SandboxError::Backend("scripted kill failure".to_string()));
        }
        state.alive.remove(sandbox_id);
        Ok(())
    }

    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .alive
            .iter()
            .map(|(id, created_at)| SandboxInfo {
                id: id.clone(),
                created_at: *created_at,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Millisecond retry policies so retry scenarios finish quickly.
pub fn fast_settings() -> ExecutorSettings {
    let fast = |max_attempts| RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
    };
    ExecutorSettings {
        create_policy: fast(3),
        agent_policy: fast(2),
        cleanup_policy: fast(3),
        ..ExecutorSettings::default()
    }
}

/// Orchestrator over `backend` with an in-memory store.
pub fn orchestrator(backend: Arc<ScriptedBackend>) -> (Orchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        backend,
        store.clone(),
        Arc::new(ClaudeRunner::new()),
        fast_settings(),
    );
    (orchestrator, store)
}

pub fn request(num_forks: u32, max_concurrent: u32) -> OrchestrationRequest {
    OrchestrationRequest::new(
        "https://example.com/acme/widgets.git",
        "main",
        "Fix the flaky test",
        num_forks,
    )
    .with_max_concurrent(max_concurrent)
}

/// Waits for a run with a generous upper bound.
pub async fn wait(orchestrator: &Orchestrator, run_id: &str) -> RunProgress {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.wait(run_id))
        .await
        .expect("run did not complete in time")
        .expect("run vanished")
}

/// Polls until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Every sandbox id ever created, as a set.
pub fn created_set(backend: &ScriptedBackend) -> HashSet<SandboxId> {
    backend.created().into_iter().collect()
}
