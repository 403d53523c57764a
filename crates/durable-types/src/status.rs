//! Task and step status enums.
//!
//! Terminal statuses are final: a task or step never transitions out of
//! them. See [`crate::invariants`] for the transition checker that
//! enforces this.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Stalled,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are final: completed, failed, cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// True for the statuses `start_next_task` may consider as candidates
    /// once their blocking steps clear (`pending`, `stalled`). `running`
    /// is in flight, terminal statuses are resolved.
    pub fn is_schedulable_shape(self) -> bool {
        matches!(self, Self::Pending | Self::Stalled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    #[default]
    Pending,
    Stalled,
    Waiting,
    Completed,
    Failed,
}

impl StepStatus {
    /// A step never regresses from `completed`/`failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A step in this state blocks its owning task from being picked
    /// regardless of the task's own status: `stalled` with an unexpired
    /// timer, or `waiting` with an unmatched filter.
    pub fn is_blocking(self, timer_expired: bool) -> bool {
        match self {
            Self::Stalled => !timer_expired,
            Self::Waiting => true,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Stalled => "stalled",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn step_blocking_rules() {
        assert!(StepStatus::Waiting.is_blocking(true));
        assert!(StepStatus::Waiting.is_blocking(false));
        assert!(StepStatus::Stalled.is_blocking(false));
        assert!(!StepStatus::Stalled.is_blocking(true));
        assert!(!StepStatus::Completed.is_blocking(false));
    }
}
