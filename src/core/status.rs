//! Status enums for actions and runs, and the transitions each allows.

use super::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a single action within a run.
///
/// Forward path: `Pending -> Ready -> Running -> Complete | Failed`.
/// Rollback path: `Complete -> RollingBack -> RolledBack | Failed`, and
/// `Pending | Ready -> Skipped` for actions that never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    /// Dependencies are complete and the action is queued for a free slot.
    Ready,
    Running,
    Complete,
    Failed,
    Skipped,
    RollingBack,
    RolledBack,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Ready => "READY",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Complete => "COMPLETE",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Skipped => "SKIPPED",
            ActionStatus::RollingBack => "ROLLING_BACK",
            ActionStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Returns true if no forward transition leaves this status.
    ///
    /// `Complete` is terminal for execution; it can only be left by the
    /// rollback sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Complete
                | ActionStatus::Failed
                | ActionStatus::Skipped
                | ActionStatus::RolledBack
        )
    }

    /// Returns true if a runner may claim an action in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::Ready)
    }

    /// Returns true if the action state machine allows `self -> next`.
    ///
    /// `Running -> Running` is permitted so a runner can record each attempt,
    /// and `Running -> Pending` so a stale claim can be reclaimed on resume.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Pending, Ready | Running | Skipped)
                | (Ready, Pending | Running | Skipped)
                | (Running, Running | Complete | Failed | Pending)
                | (Complete, RollingBack)
                | (RollingBack, RolledBack | Failed)
        )
    }

    /// Checks a transition, returning `CoreError::IllegalTransition` if it is not allowed.
    pub fn check_transition(&self, next: ActionStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ActionStatus::Pending),
            "READY" => Ok(ActionStatus::Ready),
            "RUNNING" => Ok(ActionStatus::Running),
            "COMPLETE" => Ok(ActionStatus::Complete),
            "FAILED" => Ok(ActionStatus::Failed),
            "SKIPPED" => Ok(ActionStatus::Skipped),
            "ROLLING_BACK" => Ok(ActionStatus::RollingBack),
            "ROLLED_BACK" => Ok(ActionStatus::RolledBack),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// Overall status of a run.
///
/// `Cancelled` behaves exactly like `Failed`: dispatch stops and the
/// rollback sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::RollingBack => "ROLLING_BACK",
            RunStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Terminal runs are immutable; re-invoking them is a no-op.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::RolledBack)
    }

    /// Returns true if the run must be (or is being) rolled back.
    pub fn needs_rollback(&self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::RollingBack
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
                | (Failed | Cancelled, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    pub fn check_transition(&self, next: RunStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            "ROLLING_BACK" => Ok(RunStatus::RollingBack),
            "ROLLED_BACK" => Ok(RunStatus::RolledBack),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}
