//! Run-level control signals.
//!
//! Signals are fire-and-forget: they are queued to the run's controller and
//! observed on its next loop iteration. Nothing waits for in-flight work to
//! stop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A control signal for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSignal {
    /// Stop admitting new forks; running forks continue.
    Pause,
    /// Re-enable admission after a pause.
    Resume,
    /// Stop admitting, interrupt running forks, and cancel pending ones.
    Cancel,
}

impl RunSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            RunSignal::Pause => "pause",
            RunSignal::Resume => "resume",
            RunSignal::Cancel => "cancel",
        }
    }
}

impl fmt::Display for RunSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pause" => Ok(RunSignal::Pause),
            "resume" => Ok(RunSignal::Resume),
            "cancel" => Ok(RunSignal::Cancel),
            other => Err(Error::Config(format!("unknown signal: {}", other))),
        }
    }
}
