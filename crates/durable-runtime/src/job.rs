//! Job definitions (§4.6, §6): a handle binding an id, orchestration
//! options, lifecycle listeners, and the user function itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use durable_journal::ExecutionError;
use durable_journal::ctx::Ctx;
use durable_types::{Backoff, EventKey, JOB_LIFECYCLE_EVENTS};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::pipe::{Transform, TransformedPipe};

/// The user task function: given the execution context and the parsed
/// input, produce the serialized output.
pub type JobFn = Arc<dyn for<'a> Fn(Ctx<'a>, Value) -> BoxFuture<'a, Result<Value, ExecutionError>> + Send + Sync>;

/// A listener callback for one of a job's fixed lifecycle events.
/// Payload shape matches §6: `{input, result?, error?, reason?}`.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// A grouping-key function for debounce/throttle/rate-limit: derives a
/// group id from the task input. `None` groups every invocation of the
/// job together (the common case: "only the latest call to this job
/// matters").
pub type GroupKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// The seam to an externally supplied schema validator (§1: "the input
/// validator library" is a host collaborator, only its interface is
/// specified here). Returning `Err` fails the task non-recoverably
/// rather than through the retry path, matching a shape mismatch rather
/// than a flaky call.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct DebounceSpec {
    pub by: Option<GroupKeyFn>,
    pub delay: StdDuration,
}

#[derive(Clone)]
pub struct ThrottleSpec {
    pub by: Option<GroupKeyFn>,
    pub duration: StdDuration,
}

#[derive(Clone)]
pub struct RateLimitSpec {
    pub by: Option<GroupKeyFn>,
    pub window: StdDuration,
}

/// A source in a job's `triggers` list: either a bare event key (a pipe,
/// or another job's lifecycle event) or a pipe whose input is run
/// through a transform before it becomes this job's trigger input
/// (`Pipe::into(transform)`, §4.6/§6).
#[derive(Clone)]
pub enum Trigger {
    Direct(EventKey),
    Transformed { pipe_id: String, transform: Transform },
}

impl Trigger {
    pub(crate) fn key(&self) -> String {
        match self {
            Self::Direct(key) => key.to_string(),
            Self::Transformed { pipe_id, .. } => EventKey::pipe(pipe_id).to_string(),
        }
    }

    pub(crate) fn transform(&self) -> Option<&Transform> {
        match self {
            Self::Direct(_) => None,
            Self::Transformed { transform, .. } => Some(transform),
        }
    }
}

impl From<EventKey> for Trigger {
    fn from(key: EventKey) -> Self {
        Self::Direct(key)
    }
}

impl From<TransformedPipe> for Trigger {
    fn from(pipe: TransformedPipe) -> Self {
        Self::Transformed { pipe_id: pipe.pipe_id, transform: pipe.transform }
    }
}

#[derive(Clone, Default)]
pub struct JobOptions {
    /// Pipes (plain or transformed) and event keys that trigger this job.
    pub triggers: Vec<Trigger>,
    /// Cron expression, meaningful only when the `cron` feature (or a
    /// host-supplied `CronSchedule`) is wired in at the Queue level.
    pub cron: Option<String>,
    pub priority: i64,
    pub debounce: Option<DebounceSpec>,
    pub throttle: Option<ThrottleSpec>,
    pub rate_limit: Option<RateLimitSpec>,
    pub timeout: Option<StdDuration>,
    pub retry: u32,
    pub backoff: Backoff,
    /// Checked against the parsed input before the task function runs.
    pub input: Option<Validator>,
    /// Checked against the serialized result once the task function
    /// returns, before the task is resolved `completed`.
    pub output: Option<Validator>,
}

pub struct Job {
    pub id: String,
    pub options: JobOptions,
    pub(crate) func: JobFn,
    listeners: HashMap<&'static str, Vec<Listener>>,
}

impl Job {
    pub fn new<F>(id: impl Into<String>, options: JobOptions, func: F) -> Self
    where
        F: for<'a> Fn(Ctx<'a>, Value) -> BoxFuture<'a, Result<Value, ExecutionError>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            options,
            func: Arc::new(func),
            listeners: HashMap::new(),
        }
    }

    /// Register a listener for one of the fixed lifecycle events
    /// (`trigger`, `start`, `run`, `success`, `error`, `cancel`,
    /// `settled`). Panics on an unrecognized event name, matching the
    /// fixed-set contract in §4.6.
    pub fn on(&mut self, event: &'static str, listener: Listener) {
        assert!(
            JOB_LIFECYCLE_EVENTS.contains(&event),
            "unknown job lifecycle event {event:?}"
        );
        self.listeners.entry(event).or_default().push(listener);
    }

    pub(crate) fn emit(&self, event: &str, payload: &Value) {
        if let Some(listeners) = self.listeners.get(event) {
            for listener in listeners {
                listener(payload);
            }
        }
    }

    pub(crate) fn group_key(by: &Option<GroupKeyFn>, default: &str, input: &Value) -> String {
        match by {
            Some(f) => f(input),
            None => default.to_string(),
        }
    }
}
