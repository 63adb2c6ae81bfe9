//! Indexing run status state machine.
//!
//! ```text
//! NotStarted ──claim──▶ InProgress ──┬──▶ Success
//!     │                              ├──▶ Failed
//!     └──────cancel──────────────────┴──▶ Canceled
//! ```
//!
//! Terminal states are final. Every status change in a store goes through
//! [`RunStatus::can_transition_to`] so that a monitor sweep and a worker
//! racing on the same run can never move it out of a terminal state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of one indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 5] = [
        RunStatus::NotStarted,
        RunStatus::InProgress,
        RunStatus::Success,
        RunStatus::Failed,
        RunStatus::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Whether a run in `self` may move to `next`.
    ///
    /// Self-transitions are rejected so that a compare-and-swap update
    /// always reports whether it actually changed anything.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::NotStarted, RunStatus::InProgress) => true,
            // A run canceled or reaped before any worker claimed it.
            (RunStatus::NotStarted, RunStatus::Canceled) => true,
            (RunStatus::NotStarted, RunStatus::Failed) => true,
            (RunStatus::InProgress, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown run status: '{}'", s))
    }
}
