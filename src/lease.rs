//! Sandbox leases: which fork owns which sandbox.
//!
//! A lease is written as soon as a sandbox exists and deleted by the owning
//! fork's cleanup stage. Anything the sweeper finds without a live lease is an
//! orphan.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::run::OrchestrationRun;

/// Association between a sandbox and the fork that provisioned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLease {
    /// Leased sandbox.
    pub sandbox_id: String,
    /// Owning run.
    pub run_id: String,
    /// Owning fork.
    pub fork_number: u32,
    /// When the sandbox was provisioned.
    pub created_at: DateTime<Utc>,
}

impl SandboxLease {
    /// Creates a lease stamped now.
    pub fn new(sandbox_id: impl Into<String>, run_id: impl Into<String>, fork_number: u32) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            run_id: run_id.into(),
            fork_number,
            created_at: Utc::now(),
        }
    }

    /// Age of the leased sandbox at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Returns true if this lease no longer protects its sandbox.
    ///
    /// A lease is orphaned when its run is unknown or already completed and
    /// the sandbox is older than `max_age`.
    pub fn is_orphaned(
        &self,
        run: Option<&OrchestrationRun>,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> bool {
        let run_live = run.map(|run| run.completed_at.is_none()).unwrap_or(false);
        !run_live && self.age(now) > max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::OrchestrationRequest;

    fn lease_aged(minutes: i64) -> SandboxLease {
        SandboxLease {
            created_at: Utc::now() - Duration::minutes(minutes),
            ..SandboxLease::new("sbx-1", "run-1", 1)
        }
    }

    fn run(completed: bool) -> OrchestrationRun {
        let request = OrchestrationRequest::new("https://example.com/repo.git", "main", "go", 1);
        let mut run = OrchestrationRun::new("run-1", request);
        if completed {
            run.completed_at = Some(Utc::now());
        }
        run
    }

    #[test]
    fn lease_of_live_run_is_never_orphaned() {
        let lease = lease_aged(600);
        assert!(!lease.is_orphaned(Some(&run(false)), Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn old_lease_of_completed_or_unknown_run_is_orphaned() {
        let lease = lease_aged(60);
        assert!(lease.is_orphaned(Some(&run(true)), Utc::now(), Duration::minutes(30)));
        assert!(lease.is_orphaned(None, Utc::now(), Duration::minutes(30)));
    }

    #[test]
    fn young_lease_is_left_alone() {
        let lease = lease_aged(1);
        assert!(!lease.is_orphaned(None, Utc::now(), Duration::minutes(30)));
    }
}
