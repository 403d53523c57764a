//! The public-facing half of the engine (§4.4-4.6, §9): Job/Pipe
//! definitions, the scheduler loop, the registration context, and the
//! `Queue` that binds them all to a [`durable_storage::Storage`]
//! backend.

pub mod cron;
pub mod error;
pub mod job;
pub mod logger;
pub mod pipe;
pub mod queue;
pub mod registration;
pub mod scheduler;

pub use cron::{CronFactory, CronSchedule};
pub use error::RuntimeError;
pub use job::{
    DebounceSpec, GroupKeyFn, Job, JobFn, JobOptions, Listener, RateLimitSpec, ThrottleSpec, Trigger, Validator,
};
pub use logger::{Logger, TracingLogger};
pub use pipe::{Pipe, Transform, TransformedPipe};
pub use queue::{current, with_current, Queue, QueueConfig, TriggerOutcome};
pub use scheduler::{NoopSchedulerHook, SchedulerHook};

pub use durable_journal::{Ctx, ExecutionError, RunOptions, StepError, WaitOptions};
pub use durable_storage::{Storage, StorageError, Task};
