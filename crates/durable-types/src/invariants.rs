//! Task/step/event transition invariants.
//!
//! These are the invariants from §3 of the data model, expressed as
//! checks over a requested transition rather than a full event log:
//! `durable-storage` calls these before committing a row update so a
//! breach is surfaced as a typed error instead of a silently-wrong write.
//!
//! Grouped: Task (T-1..T-2), Step (S-1..S-3), Uniqueness (U-1..U-2),
//! Event (E-1).

use std::fmt;

use crate::status::{StepStatus, TaskStatus};

/// A specific invariant violation. Each variant maps to one invariant
/// from §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionViolation {
    /// T-1: a task never leaves a terminal status (completed, failed,
    /// cancelled).
    TaskLeftTerminal {
        from: TaskStatus,
        to: TaskStatus,
    },
    /// T-2: a task already `running` cannot be picked again before it is
    /// requeued or resolved.
    TaskAlreadyRunning,
    /// S-1: a step never regresses from a terminal status (completed,
    /// failed).
    StepLeftTerminal {
        from: StepStatus,
        to: StepStatus,
    },
    /// S-2: `waiting` may only transition to `completed` (filter match)
    /// or `failed` (timeout).
    WaitingToIllegalStatus { to: StepStatus },
    /// S-3: only `pending`/`stalled` may transition into `running`.
    IllegalTransitionToRunning { from: StepStatus },
    /// U-1: `(queue, job, key)` must be unique among tasks.
    DuplicateTaskKey {
        queue: String,
        job: String,
        key: String,
    },
    /// U-2: `(queue, job, key, step)` must be unique among steps.
    DuplicateStepKey {
        queue: String,
        job: String,
        key: String,
        step: String,
    },
    /// E-1: events within one queue must be appended in non-decreasing
    /// `created_at` order.
    EventOutOfOrder {
        queue: String,
        previous: f64,
        attempted: f64,
    },
}

impl fmt::Display for TransitionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskLeftTerminal { from, to } => {
                write!(f, "T-1: task left terminal status {from} for {to}")
            }
            Self::TaskAlreadyRunning => write!(f, "T-2: task is already running"),
            Self::StepLeftTerminal { from, to } => {
                write!(f, "S-1: step left terminal status {from} for {to}")
            }
            Self::WaitingToIllegalStatus { to } => write!(
                f,
                "S-2: waiting step may only transition to completed or failed, got {to}"
            ),
            Self::IllegalTransitionToRunning { from } => write!(
                f,
                "S-3: only pending/stalled steps may transition to running, got {from}"
            ),
            Self::DuplicateTaskKey { queue, job, key } => write!(
                f,
                "U-1: duplicate task key (queue={queue}, job={job}, key={key})"
            ),
            Self::DuplicateStepKey {
                queue,
                job,
                key,
                step,
            } => write!(
                f,
                "U-2: duplicate step key (queue={queue}, job={job}, key={key}, step={step})"
            ),
            Self::EventOutOfOrder {
                queue,
                previous,
                attempted,
            } => write!(
                f,
                "E-1: event for queue {queue} appended out of order (previous={previous}, attempted={attempted})"
            ),
        }
    }
}

impl std::error::Error for TransitionViolation {}

/// Check a requested task status transition.
pub fn check_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionViolation> {
    if from.is_terminal() && from != to {
        return Err(TransitionViolation::TaskLeftTerminal { from, to });
    }
    if from == TaskStatus::Running && to == TaskStatus::Running {
        return Err(TransitionViolation::TaskAlreadyRunning);
    }
    Ok(())
}

/// Check a requested step status transition.
pub fn check_step_transition(from: StepStatus, to: StepStatus) -> Result<(), TransitionViolation> {
    if from.is_terminal() && from != to {
        return Err(TransitionViolation::StepLeftTerminal { from, to });
    }
    if from == StepStatus::Waiting
        && to != StepStatus::Waiting
        && !matches!(to, StepStatus::Completed | StepStatus::Failed)
    {
        return Err(TransitionViolation::WaitingToIllegalStatus { to });
    }
    if to == StepStatus::Running
        && !matches!(from, StepStatus::Pending | StepStatus::Stalled | StepStatus::Running)
    {
        return Err(TransitionViolation::IllegalTransitionToRunning { from });
    }
    Ok(())
}

/// Check that an event's timestamp does not precede the last appended
/// event for the same queue.
pub fn check_event_order(
    queue: &str,
    previous: Option<f64>,
    attempted: f64,
) -> Result<(), TransitionViolation> {
    if let Some(previous) = previous {
        if attempted < previous {
            return Err(TransitionViolation::EventOutOfOrder {
                queue: queue.to_string(),
                previous,
                attempted,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_terminal_is_final() {
        let result = check_task_transition(TaskStatus::Completed, TaskStatus::Pending);
        assert!(matches!(result, Err(TransitionViolation::TaskLeftTerminal { .. })));
    }

    #[test]
    fn task_same_terminal_status_is_a_noop_not_a_violation() {
        assert!(check_task_transition(TaskStatus::Completed, TaskStatus::Completed).is_ok());
    }

    #[test]
    fn step_waiting_can_only_complete_or_fail() {
        assert!(check_step_transition(StepStatus::Waiting, StepStatus::Completed).is_ok());
        assert!(check_step_transition(StepStatus::Waiting, StepStatus::Failed).is_ok());
        assert!(matches!(
            check_step_transition(StepStatus::Waiting, StepStatus::Running),
            Err(TransitionViolation::WaitingToIllegalStatus { .. })
        ));
    }

    #[test]
    fn step_regression_from_completed_is_rejected() {
        assert!(matches!(
            check_step_transition(StepStatus::Completed, StepStatus::Running),
            Err(TransitionViolation::StepLeftTerminal { .. })
        ));
    }

    #[test]
    fn pending_and_stalled_may_become_running() {
        assert!(check_step_transition(StepStatus::Pending, StepStatus::Running).is_ok());
        assert!(check_step_transition(StepStatus::Stalled, StepStatus::Running).is_ok());
    }

    #[test]
    fn precedence_t1_over_t2_when_terminal_and_rerunning_requested() {
        // A completed task asked to go "running" again is a terminal
        // violation (T-1), not a re-running violation (T-2) — T-1 is
        // checked first.
        let result = check_task_transition(TaskStatus::Completed, TaskStatus::Running);
        assert!(matches!(result, Err(TransitionViolation::TaskLeftTerminal { .. })));
    }

    #[test]
    fn event_order_rejects_earlier_timestamp() {
        assert!(check_event_order("q", Some(10.0), 5.0).is_err());
        assert!(check_event_order("q", Some(10.0), 10.0).is_ok());
        assert!(check_event_order("q", None, 0.0).is_ok());
    }
}
