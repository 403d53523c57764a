//! Glob-importable surface for host applications defining jobs:
//! `use durable::prelude::*;` brings in the context type, the
//! registration builders, and the error types a job closure needs to
//! name.

pub use crate::{
    Ctx, Error, ExecutionError, Job, JobOptions, Pipe, Queue, QueueConfig, RunOptions, StepError,
    Storage, Task, TaskStatus, WaitOptions,
};
pub use durable_storage::SqliteStorage;
