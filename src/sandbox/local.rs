//! Directory-backed sandbox backend for running forks on the local machine.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::provider::{
    CommandOutput, SandboxBackend, SandboxError, SandboxHandle, SandboxId, SandboxInfo,
    SandboxRequest,
};

const METADATA_FILE: &str = "sandbox.json";
const WORKSPACE_DIR: &str = "workspace";
const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Metadata persisted next to each sandbox workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxMetadata {
    template: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    env: HashMap<String, String>,
}

/// Sends SIGKILL to every process in group `pgid`. A group that is already
/// gone is not an error.
fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to kill process group"),
    }
}

/// Process groups of the commands currently running in each sandbox.
#[derive(Debug, Clone, Default)]
struct ProcessGroups(Arc<Mutex<HashMap<SandboxId, HashSet<i32>>>>);

impl ProcessGroups {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SandboxId, HashSet<i32>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, sandbox_id: &str, pgid: i32) -> GroupGuard {
        self.lock()
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(pgid);
        GroupGuard {
            groups: self.clone(),
            sandbox_id: sandbox_id.to_string(),
            pgid,
        }
    }

    fn release(&self, sandbox_id: &str, pgid: i32) {
        let mut groups = self.lock();
        if let Some(live) = groups.get_mut(sandbox_id) {
            live.remove(&pgid);
            if live.is_empty() {
                groups.remove(sandbox_id);
            }
        }
    }

    fn take(&self, sandbox_id: &str) -> HashSet<i32> {
        self.lock().remove(sandbox_id).unwrap_or_default()
    }

    #[cfg(test)]
    fn count(&self, sandbox_id: &str) -> usize {
        self.lock().get(sandbox_id).map(HashSet::len).unwrap_or(0)
    }
}

/// Kills a command's process group when the command finishes, times out, or
/// has its future dropped, so no descendant outlives the call.
struct GroupGuard {
    groups: ProcessGroups,
    sandbox_id: SandboxId,
    pgid: i32,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.groups.release(&self.sandbox_id, self.pgid);
        kill_group(self.pgid);
    }
}

/// A sandbox backend where each sandbox is a private directory.
///
/// Commands run through `sh -c` inside `<root>/<id>/workspace` with the
/// sandbox environment applied, each in its own process group. The whole
/// group is killed when the command ends, times out or is cancelled, and
/// `kill` terminates every group still running in the sandbox before
/// removing its directory.
#[derive(Debug, Clone)]
pub struct LocalSandboxBackend {
    /// Directory holding one subdirectory per sandbox.
    root: PathBuf,
    groups: ProcessGroups,
}

impl LocalSandboxBackend {
    /// Creates a backend rooted at `root`. If None, uses a temp directory.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root
                .unwrap_or_else(|| std::env::temp_dir().join("fork-orchestrator-sandboxes")),
            groups: ProcessGroups::default(),
        }
    }

    /// Returns the directory holding all sandboxes.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generate_id() -> SandboxId {
        format!("sbx-{}", uuid::Uuid::new_v4().simple())
    }

    /// Resolves a sandbox id to its directory, rejecting ids that would escape the root.
    fn sandbox_dir(&self, sandbox_id: &str) -> Option<PathBuf> {
        let valid = !sandbox_id.is_empty()
            && sandbox_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.root.join(sandbox_id))
    }

    async fn read_metadata(&self, sandbox_id: &str) -> Result<SandboxMetadata, SandboxError> {
        let dir = self
            .sandbox_dir(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        let raw = match tokio::fs::read_to_string(dir.join(METADATA_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound(sandbox_id.to_string()))
            }
            Err(e) => return Err(SandboxError::Backend(e.to_string())),
        };
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::Backend(format!("corrupt metadata for {}: {}", sandbox_id, e))
        })
    }
}

#[async_trait]
impl SandboxBackend for LocalSandboxBackend {
    async fn create(&self, request: &SandboxRequest) -> Result<SandboxId, SandboxError> {
        if request.template.trim().is_empty() {
            return Err(SandboxError::Provisioning {
                message: "template must not be empty".to_string(),
                retryable: false,
            });
        }

        let id = Self::generate_id();
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(dir.join(WORKSPACE_DIR))
            .await
            .map_err(|e| SandboxError::Provisioning {
                message: format!("failed to create {}: {}", dir.display(), e),
                retryable: true,
            })?;

        let created_at = Utc::now();
        let lifetime =
            chrono::Duration::seconds(request.timeout_secs.min(MAX_LIFETIME_SECS) as i64);
        let metadata = SandboxMetadata {
            template: request.template.clone(),
            created_at,
            expires_at: created_at + lifetime,
            env: request.env.clone(),
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| SandboxError::Backend(e.to_string()))?;
        tokio::fs::write(dir.join(METADATA_FILE), json)
            .await
            .map_err(|e| SandboxError::Provisioning {
                message: format!("failed to write sandbox metadata: {}", e),
                retryable: true,
            })?;

        tracing::info!(
            sandbox_id = %id,
            template = %request.template,
            path = ?dir,
            "created local sandbox"
        );

        Ok(id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
        self.read_metadata(sandbox_id).await?;
        Ok(SandboxHandle::new(sandbox_id))
    }

    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, SandboxError> {
        match self.read_metadata(&handle.id).await {
            Ok(metadata) => Ok(Utc::now() < metadata.expires_at),
            Err(SandboxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout_secs: u64,
    ) -> Result<CommandOutput, SandboxError> {
        let metadata = self.read_metadata(&handle.id).await?;
        let workspace = self.root.join(&handle.id).join(WORKSPACE_DIR);

        tracing::debug!(sandbox_id = %handle.id, command = %command, "running sandbox command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workspace)
            .envs(&metadata.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Command(format!("failed to spawn sh: {}", e)))?;
        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| SandboxError::Command("spawned shell has no pid".to_string()))?;
        let _group = self.groups.register(&handle.id, pgid);

        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(SandboxError::Command(format!(
                "failed to collect command output: {}",
                e
            ))),
            Err(_) => Err(SandboxError::Timeout {
                seconds: timeout_secs,
            }),
        }
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let Some(dir) = self.sandbox_dir(sandbox_id) else {
            tracing::debug!(sandbox_id = %sandbox_id, "kill of malformed sandbox id is a no-op");
            return Ok(());
        };

        for pgid in self.groups.take(sandbox_id) {
            tracing::debug!(sandbox_id = %sandbox_id, pgid, "killing sandbox process group");
            kill_group(pgid);
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(sandbox_id = %sandbox_id, "killed local sandbox");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(sandbox_id = %sandbox_id, "sandbox already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::Backend(format!(
                "failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SandboxError::Backend(e.to_string())),
        };

        let mut sandboxes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?
        {
            let id = entry.file_name().to_string_lossy().to_string();
            match self.read_metadata(&id).await {
                Ok(metadata) => sandboxes.push(SandboxInfo {
                    id,
                    created_at: metadata.created_at,
                }),
                Err(e) => {
                    tracing::debug!(entry = %id, error = %e, "skipping non-sandbox entry");
                }
            }
        }

        Ok(sandboxes)
    }

    fn name(&self) -> &str {
        "local"
    }
}
