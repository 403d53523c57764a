//! The narrow seam the execution context uses to reach back out to
//! `durable-runtime` without depending on it: `invoke`/`dispatch`/`cancel`
//! need to start or signal other tasks, which is a queue-level concern.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutionError;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Fire-and-forget start of `job` with `input`, on whatever queue the
    /// caller is bound to (§9 registration context).
    async fn dispatch(&self, job: &str, input: Value) -> Result<(), ExecutionError>;

    /// Request cancellation of a running job instance.
    async fn cancel(&self, job: &str, input: Value, reason: Value) -> Result<(), ExecutionError>;
}

/// Cooperative, best-effort signal that the task currently replaying has
/// been asked to cancel. Consulted at every step boundary so a
/// concurrently-requested cancellation is observed promptly without
/// requiring the in-flight step future itself to poll anything.
pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// The default signal for a task with no concurrent cancellation path
/// (tests, or a queue that hasn't wired one up yet).
pub struct NeverCancelled;

impl CancelSignal for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}
