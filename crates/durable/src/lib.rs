//! Facade crate: a single dependency for host applications embedding
//! the durable task queue, re-exporting the public surface of
//! `durable-types`, `durable-storage`, `durable-journal`, and
//! `durable-runtime`. Mirrors the teacher's `invariant-types`
//! top-level re-export pattern, generalized to span all four crates.

pub mod prelude;

pub use durable_journal::{CancelHandle, Ctx, ExecutionError, RunOptions, StepError, WaitOptions};
pub use durable_runtime::{
    current, with_current, CronFactory, CronSchedule, DebounceSpec, GroupKeyFn, Job, JobFn, JobOptions,
    Listener, Logger, NoopSchedulerHook, Pipe, Queue, QueueConfig, RateLimitSpec, RuntimeError,
    SchedulerHook, ThrottleSpec, TracingLogger, TriggerOutcome, Validator,
};
pub use durable_storage::{
    SqliteStorage, SqliteStorageConfig, Storage, StorageError, Task, TaskId,
};
pub use durable_types::{
    canonicalize, compute_key, matches_filter, Backoff, ErrorKind, EventKey, Frequency,
    SerializedError, StepStatus, TaskStatus, TypeError,
};

use thiserror::Error;

/// Unifies the per-crate error taxonomies for host call sites that
/// don't need to distinguish which layer failed, following the
/// teacher's pattern of re-exporting subordinate error types rather
/// than flattening their variants away.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Type(#[from] TypeError),
}
