//! Workflow job state machine.
//!
//! Transitions are forward-only:
//!
//! ```text
//! QUEUED ──> RUNNING ──> SUCCESS
//!    │          │
//!    └──────────┴──────> STOPPED
//! ```
//!
//! `STOPPED` and `SUCCESS` are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a workflow job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Stopped,
    Success,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Success => "SUCCESS",
        }
    }

    /// `true` for `STOPPED` and `SUCCESS`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Success)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Stopped)
                | (Self::Running, Self::Stopped)
                | (Self::Running, Self::Success)
        )
    }

    /// States from which `next` may be entered. Used by stores that apply
    /// transitions with a conditional update.
    pub fn predecessors(next: JobState) -> &'static [JobState] {
        match next {
            Self::Queued => &[],
            Self::Running => &[Self::Queued],
            Self::Stopped => &[Self::Queued, Self::Running],
            Self::Success => &[Self::Running],
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "SUCCESS" => Ok(Self::Success),
            other => Err(CoreError::Internal(format!("Unknown job state '{other}'"))),
        }
    }
}

impl TryFrom<String> for JobState {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
