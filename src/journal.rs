//! Write-ahead journal of pipeline steps.
//!
//! Each step of a fork's pipeline is recorded under
//! `step:{runId}:{forkNum}:{stage}` before it runs and again when it
//! completes. A fork re-executed after a crash reads the journal and reuses
//! completed outputs instead of repeating their side effects.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::{get_json, put_json, step_key, RunStore};

/// Stages of the fork pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CreateSandbox,
    HealthCheck,
    RunAgent,
    RecordMetrics,
    Cleanup,
}

impl Stage {
    /// Journal name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::CreateSandbox => "create",
            Stage::HealthCheck => "health",
            Stage::RunAgent => "agent",
            Stage::RecordMetrics => "metrics",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Journal entry for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: Stage,
    /// Attempts started so far, across process restarts.
    pub attempts: u32,
    /// Output of the successful attempt.
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step journal over a [`RunStore`].
#[derive(Clone)]
pub struct StepJournal {
    store: Arc<dyn RunStore>,
}

impl StepJournal {
    /// Creates a journal writing into `store`.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Loads the raw entry for a step.
    pub async fn record(
        &self,
        run_id: &str,
        fork_number: u32,
        stage: Stage,
    ) -> Result<Option<StepRecord>> {
        get_json(
            self.store.as_ref(),
            &step_key(run_id, fork_number, stage.as_str()),
        )
        .await
    }

    /// Returns the output of a step that already completed.
    pub async fn completed<T: DeserializeOwned>(
        &self,
        run_id: &str,
        fork_number: u32,
        stage: Stage,
    ) -> Result<Option<T>> {
        match self.record(run_id, fork_number, stage).await? {
            Some(StepRecord {
                output: Some(output),
                completed_at: Some(_),
                ..
            }) => Ok(Some(serde_json::from_value(output)?)),
            _ => Ok(None),
        }
    }

    /// Records that an attempt is starting and returns its 1-based number.
    pub async fn begin(&self, run_id: &str, fork_number: u32, stage: Stage) -> Result<u32> {
        let record = match self.record(run_id, fork_number, stage).await? {
            Some(mut record) => {
                record.attempts += 1;
                record
            }
            None => StepRecord {
                stage,
                attempts: 1,
                output: None,
                started_at: Utc::now(),
                completed_at: None,
            },
        };
        let attempts = record.attempts;
        put_json(
            self.store.as_ref(),
            &step_key(run_id, fork_number, stage.as_str()),
            &record,
        )
        .await?;
        Ok(attempts)
    }

    /// Records a step's output, marking it complete.
    pub async fn complete<T: Serialize + Sync>(
        &self,
        run_id: &str,
        fork_number: u32,
        stage: Stage,
        output: &T,
    ) -> Result<()> {
        let mut record = self
            .record(run_id, fork_number, stage)
            .await?
            .unwrap_or(StepRecord {
                stage,
                attempts: 1,
                output: None,
                started_at: Utc::now(),
                completed_at: None,
            });
        record.output = Some(serde_json::to_value(output)?);
        record.completed_at = Some(Utc::now());
        put_json(
            self.store.as_ref(),
            &step_key(run_id, fork_number, stage.as_str()),
            &record,
        )
        .await
    }
}
