//! Execution lifecycle phases and the transitions allowed between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of one test key.
///
/// `Pending -> Running -> {Completed | Stopped | Failed}`; a launch failure
/// moves `Pending -> Failed` directly. Terminal phases accept nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "PENDING",
            Phase::Running => "RUNNING",
            Phase::Completed => "COMPLETED",
            Phase::Stopped => "STOPPED",
            Phase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Stopped | Phase::Failed)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        match self {
            Phase::Pending => matches!(next, Phase::Running | Phase::Failed),
            Phase::Running => matches!(next, Phase::Completed | Phase::Stopped | Phase::Failed),
            Phase::Completed | Phase::Stopped | Phase::Failed => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Phase::Pending),
            "RUNNING" => Ok(Phase::Running),
            "COMPLETED" => Ok(Phase::Completed),
            "STOPPED" => Ok(Phase::Stopped),
            "FAILED" => Ok(Phase::Failed),
            other => anyhow::bail!("unknown execution phase '{}'", other),
        }
    }
}
