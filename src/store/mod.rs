//! Key-value persistence for runs, forks, leases and metrics.
//!
//! Every record lives under its own flat key so any key-value substrate can
//! back the orchestrator:
//!
//! - `run:{runId}`
//! - `fork:{runId}:{forkNum}`
//! - `sandboxLease:{sandboxId}`
//! - `metrics:{runId}`
//! - `step:{runId}:{forkNum}:{stage}` (durable step journal)

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::fork::ForkRecord;
use crate::lease::SandboxLease;
use crate::metrics::RunMetrics;
use crate::run::OrchestrationRun;

/// Key of a run record.
pub fn run_key(run_id: &str) -> String {
    format!("run:{}", run_id)
}

/// Key of a fork record.
pub fn fork_key(run_id: &str, fork_number: u32) -> String {
    format!("fork:{}:{}", run_id, fork_number)
}

/// Key of a sandbox lease.
pub fn lease_key(sandbox_id: &str) -> String {
    format!("sandboxLease:{}", sandbox_id)
}

/// Key of a run's metrics aggregate.
pub fn metrics_key(run_id: &str) -> String {
    format!("metrics:{}", run_id)
}

/// Key of a journaled pipeline step.
pub fn step_key(run_id: &str, fork_number: u32, stage: &str) -> String {
    format!("step:{}:{}:{}", run_id, fork_number, stage)
}

/// A flat JSON key-value store.
///
/// Components receive a handle at construction; there is no global store.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns every entry whose key starts with `prefix`, ordered by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Persists a run record.
    async fn save_run(&self, run: &OrchestrationRun) -> Result<()> {
        put_json(self, &run_key(&run.run_id), run).await
    }

    /// Loads a run record.
    async fn load_run(&self, run_id: &str) -> Result<Option<OrchestrationRun>> {
        get_json(self, &run_key(run_id)).await
    }

    /// Loads every run record.
    async fn load_runs(&self) -> Result<Vec<OrchestrationRun>> {
        scan_json(self, "run:").await
    }

    /// Persists a fork record.
    async fn save_fork(&self, fork: &ForkRecord) -> Result<()> {
        put_json(self, &fork.key(), fork).await
    }

    /// Loads one fork record.
    async fn load_fork(&self, run_id: &str, fork_number: u32) -> Result<Option<ForkRecord>> {
        get_json(self, &fork_key(run_id, fork_number)).await
    }

    /// Loads every fork record of a run, ordered by fork number.
    async fn load_forks(&self, run_id: &str) -> Result<Vec<ForkRecord>> {
        let mut forks: Vec<ForkRecord> = scan_json(self, &format!("fork:{}:", run_id)).await?;
        forks.sort_by_key(|fork| fork.fork_number);
        Ok(forks)
    }

    /// Persists a sandbox lease.
    async fn save_lease(&self, lease: &SandboxLease) -> Result<()> {
        put_json(self, &lease_key(&lease.sandbox_id), lease).await
    }

    /// Removes a sandbox lease.
    async fn delete_lease(&self, sandbox_id: &str) -> Result<()> {
        self.delete(&lease_key(sandbox_id)).await
    }

    /// Loads every sandbox lease.
    async fn load_leases(&self) -> Result<Vec<SandboxLease>> {
        scan_json(self, "sandboxLease:").await
    }

    /// Persists a run's metrics aggregate.
    async fn save_metrics(&self, metrics: &RunMetrics) -> Result<()> {
        put_json(self, &metrics_key(&metrics.run_id), metrics).await
    }

    /// Loads a run's metrics aggregate.
    async fn load_metrics(&self, run_id: &str) -> Result<Option<RunMetrics>> {
        get_json(self, &metrics_key(run_id)).await
    }
}

/// Serializes `value` and stores it under `key`.
pub async fn put_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: RunStore + ?Sized,
    T: Serialize + Sync,
{
    store.put(key, serde_json::to_value(value)?).await
}

/// Loads and deserializes the value under `key`.
pub async fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: RunStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Loads and deserializes every value under `prefix`.
pub async fn scan_json<S, T>(store: &S, prefix: &str) -> Result<Vec<T>>
where
    S: RunStore + ?Sized,
    T: DeserializeOwned,
{
    store
        .scan(prefix)
        .await?
        .into_iter()
        .map(|(_, value)| serde_json::from_value(value).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_persisted_layout() {
        assert_eq!(run_key("r1"), "run:r1");
        assert_eq!(fork_key("r1", 3), "fork:r1:3");
        assert_eq!(lease_key("sbx-1"), "sandboxLease:sbx-1");
        assert_eq!(metrics_key("r1"), "metrics:r1");
        assert_eq!(step_key("r1", 3, "create"), "step:r1:3:create");
    }
}
