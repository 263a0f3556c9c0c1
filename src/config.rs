//! Orchestrator configuration and validation.
//!
//! Configuration is loaded from TOML or YAML (chosen by file extension) and
//! validated before anything is provisioned, so mistakes surface as a single
//! configuration error instead of N failed forks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::executor::ExecutorSettings;
use crate::run::OrchestrationRequest;
use crate::sandbox::SandboxRequest;
use crate::store::{FileStore, MemoryStore, RunStore};

/// Fork counts above this draw a warning.
pub const LARGE_FORK_COUNT: u32 = 100;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Merges another result, prefixing each message with `context`.
    pub fn merge_in(&mut self, context: &str, other: ValidationResult) {
        self.errors
            .extend(other.errors.into_iter().map(|e| format!("{}: {}", context, e)));
        self.warnings
            .extend(other.warnings.into_iter().map(|w| format!("{}: {}", context, w)));
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Sandbox provisioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend template every fork boots from.
    #[serde(default = "default_template")]
    pub template: String,

    /// Lifetime requested for each sandbox, in seconds.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,

    /// Extra environment for every sandbox.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Root directory of the local backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_template() -> String {
    "base".to_string()
}

fn default_lifetime_secs() -> u64 {
    3600
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            lifetime_secs: default_lifetime_secs(),
            env: HashMap::new(),
            root: None,
        }
    }
}

/// Agent CLI settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path or name of the agent CLI inside the sandbox.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,

    /// Model used when a request does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Maximum agentic turns per invocation.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Checkout directory inside the sandbox.
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_cli_path() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_max_turns() -> u32 {
    50
}

fn default_workdir() -> String {
    "repo".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            default_model: default_model(),
            max_turns: default_max_turns(),
            workdir: default_workdir(),
        }
    }
}

/// Sandbox health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// No-op command run inside a fresh sandbox.
    #[serde(default = "default_health_command")]
    pub command: String,

    /// Health check timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_command() -> String {
    "true".to_string()
}

fn default_health_timeout() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            command: default_health_command(),
            timeout_secs: default_health_timeout(),
        }
    }
}

/// Retry policies of the retried pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicy::create_sandbox")]
    pub create: RetryPolicy,

    #[serde(default = "RetryPolicy::run_agent")]
    pub agent: RetryPolicy,

    #[serde(default = "RetryPolicy::cleanup_sandbox")]
    pub cleanup: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            create: RetryPolicy::create_sandbox(),
            agent: RetryPolicy::run_agent(),
            cleanup: RetryPolicy::cleanup_sandbox(),
        }
    }
}

/// Leaked-sandbox sweeper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Sandboxes younger than this are never swept, in seconds.
    #[serde(default = "default_sweep_max_age")]
    pub max_age_secs: u64,

    /// Start the sweeper together with the orchestrator.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_max_age() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            max_age_secs: default_sweep_max_age(),
            autostart: true,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Which run store backs the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process only; lost on exit.
    #[default]
    Memory,
    /// One JSON file per key under `path`.
    File,
}

/// Run store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory of the file store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Opens the configured store.
    pub async fn open(&self) -> Result<Arc<dyn RunStore>> {
        match self.kind {
            StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreKind::File => {
                let path = self
                    .path
                    .clone()
                    .ok_or_else(|| {
                        Error::Config("store.path is required for the file store".to_string())
                    })?;
                Ok(Arc::new(FileStore::open(path).await?))
            }
        }
    }
}

/// Defaults applied to submitted runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Concurrency cap when a caller does not give one.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,

    /// Page size of run listings.
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_list_limit() -> usize {
    20
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: default_max_concurrent(),
            list_limit: default_list_limit(),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runs: RunsConfig,
}

impl OrchestratorConfig {
    /// Loads a configuration file; `.yaml`/`.yml` are read as YAML, anything
    /// else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("{}: invalid YAML: {}", path.display(), e))
            })
        } else {
            toml::from_str(&raw).map_err(|e| {
                Error::Config(format!("{}: invalid TOML: {}", path.display(), e))
            })
        }
    }

    /// Parses TOML configuration.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Parses YAML configuration.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    /// Pipeline settings derived from this configuration.
    pub fn executor_settings(&self) -> ExecutorSettings {
        let mut sandbox =
            SandboxRequest::new(self.sandbox.template.clone(), self.sandbox.lifetime_secs);
        sandbox.env = self.sandbox.env.clone();
        ExecutorSettings {
            sandbox,
            health_command: self.health.command.clone(),
            health_timeout_secs: self.health.timeout_secs,
            max_turns: self.agent.max_turns,
            workdir: self.agent.workdir.clone(),
            create_policy: self.retry.create,
            agent_policy: self.retry.agent,
            cleanup_policy: self.retry.cleanup,
        }
    }
}

impl Validate for RetryPolicy {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_attempts == 0 {
            result.add_warning("max_attempts = 0 is treated as a single attempt");
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            result.add_error("multiplier must be a finite number of at least 1");
        }

        if self.max_delay_ms < self.base_delay_ms {
            result.add_warning(
                "max_delay_ms below base_delay_ms caps every delay at base_delay_ms",
            );
        }

        result
    }
}

impl Validate for OrchestratorConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.sandbox.template.trim().is_empty() {
            result.add_error("sandbox.template cannot be empty");
        }

        if self.sandbox.lifetime_secs == 0 {
            result.add_error("sandbox.lifetime_secs must be at least 1");
        }

        if self.agent.cli_path.trim().is_empty() {
            result.add_error("agent.cli_path cannot be empty");
        }

        if self.agent.max_turns == 0 {
            result.add_error("agent.max_turns must be at least 1");
        }

        if self.agent.workdir.trim().is_empty() || self.agent.workdir.starts_with('/') {
            result.add_error("agent.workdir must be a relative directory name");
        }

        if self.health.command.trim().is_empty() {
            result.add_error("health.command cannot be empty");
        }

        if self.health.timeout_secs == 0 {
            result.add_error("health.timeout_secs must be at least 1");
        }

        result.merge_in("retry.create", self.retry.create.validate());
        result.merge_in("retry.agent", self.retry.agent.validate());
        result.merge_in("retry.cleanup", self.retry.cleanup.validate());

        if self.sweeper.interval_secs == 0 {
            result.add_error("sweeper.interval_secs must be at least 1");
        }

        // Unleased sandboxes include ones whose lease is still being written.
        if self.sweeper.max_age_secs < 60 {
            result.add_warning(
                "sweeper.max_age_secs under 60 may kill sandboxes of starting forks",
            );
        }

        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            result.add_error("store.path is required when store.kind = \"file\"");
        }

        if self.runs.default_max_concurrent == 0 {
            result.add_error("runs.default_max_concurrent must be at least 1");
        }

        if self.runs.list_limit == 0 {
            result.add_error("runs.list_limit must be at least 1");
        }

        result
    }
}

impl Validate for OrchestrationRequest {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(run_id) = &self.run_id {
            if run_id.trim().is_empty() {
                result.add_error("run_id cannot be empty");
            } else if run_id.contains(':') || run_id.contains('/') {
                result.add_error("run_id cannot contain ':' or '/'");
            }
        }

        if self.repo_url.trim().is_empty() {
            result.add_error("repo_url cannot be empty");
        }

        if self.branch.trim().is_empty() {
            result.add_error("branch cannot be empty");
        }

        if self.prompt.trim().is_empty() {
            result.add_error("prompt cannot be empty");
        }

        if self.num_forks == 0 {
            result.add_error("num_forks must be at least 1");
        }

        if self.max_concurrent == 0 {
            result.add_error("max_concurrent must be at least 1");
        }

        if self.timeout_seconds == 0 {
            result.add_error("timeout_seconds must be at least 1");
        }

        if let Some(limit) = self.budget_limit_usd {
            if !limit.is_finite() || limit < 0.0 {
                result.add_error("budget_limit_usd must be a non-negative amount");
            } else if limit == 0.0 {
                result.add_warning("budget_limit_usd = 0 short-circuits every fork");
            }
        }

        if self.max_concurrent > self.num_forks && self.num_forks > 0 {
            result.add_warning(format!(
                "max_concurrent ({}) exceeds num_forks ({}); at most {} forks will run",
                self.max_concurrent, self.num_forks, self.num_forks
            ));
        }

        if self.num_forks > LARGE_FORK_COUNT {
            result.add_warning(format!(
                "num_forks over {} may exhaust sandbox quota",
                LARGE_FORK_COUNT
            ));
        }

        if self.model.trim().is_empty() {
            result.add_warning("model is empty; the agent CLI default will be used");
        }

        result
    }
}
