//! The execution context's error taxonomy (§4.3, §7).
//!
//! [`ExecutionError::Suspend`] is the Rust analog of the host's thrown
//! `InterruptSignal`: a step operation returns it to unwind the task
//! function early via `?` when it has nothing further to do this pass.
//! It is caught in exactly one place, [`crate::replay::replay`], and must
//! never reach a caller outside this crate as a "real" failure.

use durable_storage::StorageError;
use durable_types::SerializedError;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Not a failure: the task function has nothing left to do this
    /// pass and should be requeued or left stalled.
    #[error("step suspended")]
    Suspend,

    #[error("{0}")]
    Transient(SerializedError),

    #[error("{0}")]
    NonRecoverable(SerializedError),

    #[error("cancelled: {reason}")]
    Cancelled { reason: Value },

    #[error("step timed out waiting for an event")]
    Timeout,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ExecutionError {
    /// Collapse to the serialized form stored on a failed task/step row,
    /// if this variant carries one.
    pub fn as_serialized(&self) -> Option<SerializedError> {
        match self {
            Self::Transient(e) | Self::NonRecoverable(e) => Some(e.clone()),
            _ => None,
        }
    }
}

/// The error a user step closure returns. Carries only what needs to
/// round-trip through storage; `non_recoverable` bypasses retry policy
/// entirely, matching a validation failure rather than a flaky call.
#[derive(Clone, Debug)]
pub struct StepError {
    pub message: String,
    pub non_recoverable: bool,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_recoverable: false,
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_recoverable: true,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<SerializedError> for StepError {
    fn from(err: SerializedError) -> Self {
        Self {
            message: err.message,
            non_recoverable: err.non_recoverable,
        }
    }
}

impl From<StepError> for SerializedError {
    fn from(err: StepError) -> Self {
        if err.non_recoverable {
            SerializedError::non_recoverable(err.message)
        } else {
            SerializedError::new(err.message)
        }
    }
}
