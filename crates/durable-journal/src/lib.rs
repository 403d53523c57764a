//! The execution context (§4.3): replays a task function against its
//! checkpointed steps, short-circuiting completed work and suspending on
//! anything still in flight or still blocked.

pub mod ctx;
pub mod dispatch;
pub mod error;
pub mod replay;

pub use ctx::{CancelHandle, Ctx, RunOptions, WaitOptions};
pub use dispatch::{CancelSignal, Dispatcher, NeverCancelled};
pub use error::{ExecutionError, StepError};
pub use replay::{replay, ReplayOutcome};
