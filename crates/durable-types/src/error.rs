//! Error serialization, hydration, and the non-recoverable error marker.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure category, used by retry/cancellation policy decisions
/// and as an observability dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Recoverable failure from user step code; subject to retry policy.
    Transient,
    /// Bypasses retry entirely: input/output validation mismatch, or an
    /// invariant breach inside the engine.
    NonRecoverable,
    /// Explicit, debounce-superseded, or timeout-triggered cancellation.
    Cancelled,
    /// A step- or task-level timeout elapsed.
    Timeout,
    /// Storage-layer failure; the task stays `running` to be recovered.
    Storage,
}

/// A captured error, ready to persist into a Step/Task's `data` column
/// and rehydrate later for the user-visible `invoke`/`dispatch` handle.
///
/// Captures message, an optional stack trace, and a nested cause chain —
/// mirroring how a host-language exception's `.cause`/`.source()` chain
/// is normally serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<SerializedError>>,
    #[serde(default)]
    pub non_recoverable: bool,
}

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            cause: None,
            non_recoverable: false,
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        Self {
            non_recoverable: true,
            ..Self::new(message)
        }
    }

    pub fn with_cause(mut self, cause: SerializedError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Reconstruct from a generic `std::error::Error`, walking its
    /// `source()` chain into nested `cause` entries.
    pub fn hydrate(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut serialized = Self::new(err.to_string());
        if let Some(source) = err.source() {
            serialized.cause = Some(Box::new(Self::hydrate(source)));
        }
        serialized
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SerializedError {}

/// Public error type for `durable-types` operations (duration/frequency
/// parsing failures surface through [`crate::duration::DurationParseError`]
/// directly; this wraps the remaining, crate-wide failure modes).
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("invalid duration or frequency: {0}")]
    Duration(#[from] crate::duration::DurationParseError),
    #[error("invalid step name: {0:?}")]
    InvalidStepName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hydrate_walks_source_chain() {
        #[derive(Debug)]
        struct Inner;
        impl fmt::Display for Inner {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "inner failure")
            }
        }
        impl std::error::Error for Inner {}

        #[derive(Debug)]
        struct Outer(Inner);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "outer failure")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let serialized = SerializedError::hydrate(&Outer(Inner));
        assert_eq!(serialized.message, "outer failure");
        assert_eq!(serialized.cause.unwrap().message, "inner failure");
    }

    #[test]
    fn non_recoverable_marker_survives_round_trip() {
        let err = SerializedError::non_recoverable("bad input");
        let json = serde_json::to_string(&err).unwrap();
        let back: SerializedError = serde_json::from_str(&json).unwrap();
        assert!(back.non_recoverable);
    }
}
