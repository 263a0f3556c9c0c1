//! Sandbox backend trait and types.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier assigned to a sandbox by its backend.
pub type SandboxId = String;

/// Failures reported by a sandbox backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// Sandbox creation failed. Credential or template problems are not retryable.
    #[error("provisioning failed: {message}")]
    Provisioning { message: String, retryable: bool },

    /// The sandbox no longer exists.
    #[error("sandbox {0} not found")]
    NotFound(SandboxId),

    /// A command ran past its timeout. The sandbox itself is left alive.
    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A command could not be started or its output could not be collected.
    #[error("command error: {0}")]
    Command(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Parameters for provisioning a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxRequest {
    /// Backend template (image) to boot from.
    pub template: String,

    /// Lifetime the backend should grant the sandbox, in seconds.
    pub timeout_secs: u64,

    /// Environment variables visible to every command in the sandbox.
    pub env: HashMap<String, String>,
}

impl SandboxRequest {
    /// Creates a request for the given template and lifetime.
    pub fn new(template: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            template: template.into(),
            timeout_secs,
            env: HashMap::new(),
        }
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A live connection to one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Backend identifier of the sandbox.
    pub id: SandboxId,
}

impl SandboxHandle {
    /// Wraps a sandbox identifier.
    pub fn new(id: impl Into<SandboxId>) -> Self {
        Self { id: id.into() }
    }
}

/// Captured result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `max_chars` characters of stderr (or stdout if stderr is empty), for error messages.
    pub fn error_tail(&self, max_chars: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let trimmed = source.trim();
        let count = trimmed.chars().count();
        if count <= max_chars {
            trimmed.to_string()
        } else {
            trimmed.chars().skip(count - max_chars).collect()
        }
    }
}

/// A sandbox as reported by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    /// Backend identifier.
    pub id: SandboxId,
    /// When the backend created it.
    pub created_at: DateTime<Utc>,
}

/// Provider of isolated execution environments.
///
/// `kill` must be idempotent: killing an unknown or already-dead sandbox
/// returns `Ok(())`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Provisions a new sandbox and returns its identifier.
    async fn create(&self, request: &SandboxRequest) -> Result<SandboxId, SandboxError>;

    /// Connects to an existing sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError>;

    /// Reports whether the sandbox is still alive.
    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, SandboxError>;

    /// Runs a shell command inside the sandbox.
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout_secs: u64,
    ) -> Result<CommandOutput, SandboxError>;

    /// Destroys the sandbox.
    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Lists sandboxes the backend currently holds.
    ///
    /// Backends that cannot enumerate return an empty list; the sweeper then
    /// relies on leases alone.
    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        Ok(Vec::new())
    }

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_request_builder_collects_env() {
        let request = SandboxRequest::new("base", 600)
            .with_env("RUN_ID", "r1")
            .with_env("FORK_NUMBER", "2");

        assert_eq!(request.template, "base");
        assert_eq!(request.timeout_secs, 600);
        assert_eq!(request.env.get("FORK_NUMBER").map(String::as_str), Some("2"));
    }

    #[test]
    fn error_tail_prefers_stderr() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "lots of output".to_string(),
            stderr: "fatal: repository not found\n".to_string(),
        };
        assert!(!output.success());
        assert_eq!(output.error_tail(100), "fatal: repository not found");
    }

    #[test]
    fn error_tail_truncates_from_the_front() {
        let output = CommandOutput {
            exit_code: 2,
            stdout: "abcdefghij".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.error_tail(4), "ghij");
    }
}
