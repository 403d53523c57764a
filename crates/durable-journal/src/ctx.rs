//! The execution context (§4.3): the per-replay-pass handle a task
//! function holds, exposing `run`/`sleep`/`wait_for`/`invoke` as
//! idempotent, storage-checkpointed operations.
//!
//! A task function is re-run from the top on every scheduler pick.
//! Completed steps short-circuit to their stored result instead of
//! re-executing; a step still in flight or still blocked returns
//! [`ExecutionError::Suspend`], which the caller propagates with `?` all
//! the way out of the task function. Unlike the host runtime this was
//! learned from, a `run()` call whose closure is a plain `async fn` is
//! simply awaited in place — Rust's own executor already holds the
//! task's in-memory future open across concurrent sibling awaits
//! (`tokio::try_join!` and friends), so there is no need for a separate
//! pending-side-effect queue to join before suspending. True suspension
//! — ending this pass without resuming in-process — is reserved for
//! work that must survive a restart or an unbounded wait: sleeping,
//! waiting on an event, and a step that failed and needs a retry
//! backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use durable_storage::{Step, StepFields, Storage, Task, TaskId};
use durable_types::{Backoff, EventKey, SerializedError, StepCounters, StepNamespace, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dispatch::{CancelSignal, Dispatcher};
use crate::error::{ExecutionError, StepError};

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Options for [`Ctx::run`]: how many additional attempts to make after
/// the first failure, the backoff between them, and an optional
/// per-attempt deadline.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub retry: u32,
    pub backoff: Backoff,
    /// Enforced live on the in-flight future via `tokio::time::timeout`,
    /// not persisted to storage: a `run` step resolves within a single
    /// replay pass, so there is nothing for a restart to resume across
    /// (unlike `wait_for`, whose timeout must survive a process crash
    /// and is therefore stored as an absolute `timeout_at`).
    pub timeout: Option<std::time::Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry: 0,
            backoff: Backoff::default(),
            timeout: None,
        }
    }
}

/// Options for [`Ctx::wait_for`].
#[derive(Clone, Debug)]
pub struct WaitOptions {
    /// Match events recorded before this step was first reached, not
    /// only ones recorded after (§4.5 `wait_from`). Defaults to `true`.
    pub retroactive: bool,
    pub timeout_secs: Option<f64>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            retroactive: true,
            timeout_secs: None,
        }
    }
}

pub struct Ctx<'a> {
    task: &'a Task,
    storage: &'a dyn Storage,
    dispatcher: &'a dyn Dispatcher,
    cancel: &'a dyn CancelSignal,
    steps: HashMap<String, Step>,
    counters: Mutex<StepCounters>,
}

/// Passed into a `run` closure so a long-running body can observe
/// task-level cancellation without waiting for the next step boundary.
/// `CancelSignal` is a plain predicate rather than a waker, so
/// [`CancelHandle::cancelled`] polls it at a fixed interval.
#[derive(Clone, Copy)]
pub struct CancelHandle<'a> {
    signal: &'a dyn CancelSignal,
}

const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

impl<'a> CancelHandle<'a> {
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the task has been asked to cancel; never resolves
    /// otherwise, so racing it with a step body cooperatively aborts the
    /// body as soon as cancellation is observed.
    pub async fn cancelled(&self) {
        while !self.signal.is_cancelled() {
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }
}

impl<'a> Ctx<'a> {
    pub fn new(
        task: &'a Task,
        steps: Vec<Step>,
        storage: &'a dyn Storage,
        dispatcher: &'a dyn Dispatcher,
        cancel: &'a dyn CancelSignal,
    ) -> Self {
        Self {
            task,
            storage,
            dispatcher,
            cancel,
            steps: steps.into_iter().map(|s| (s.step.clone(), s)).collect(),
            counters: Mutex::new(StepCounters::new()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn input(&self) -> Result<Value, ExecutionError> {
        serde_json::from_str(&self.task.input)
            .map_err(|e| ExecutionError::NonRecoverable(SerializedError::non_recoverable(e.to_string())))
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn next_name(&self, namespace: StepNamespace, id: &str) -> String {
        self.counters.lock().expect("ctx counters poisoned").next(namespace, id).to_string()
    }

    /// A user-named, idempotent unit of work (§4.3 "run"). Retried up to
    /// `options.retry` additional times with `options.backoff` between
    /// attempts; a non-recoverable error never retries.
    pub async fn run<T, F, Fut>(&self, id: &str, options: RunOptions, f: F) -> Result<T, ExecutionError>
    where
        F: FnOnce(CancelHandle<'_>) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
        T: Serialize + DeserializeOwned,
    {
        let name = self.next_name(StepNamespace::User, id);
        self.run_named(name, options, f).await
    }

    async fn run_named<T, F, Fut>(&self, name: String, options: RunOptions, f: F) -> Result<T, ExecutionError>
    where
        F: FnOnce(CancelHandle<'_>) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
        T: Serialize + DeserializeOwned,
    {
        if self.is_cancelled() {
            return Err(ExecutionError::Suspend);
        }

        if let Some(existing) = self.steps.get(&name) {
            match existing.status() {
                StepStatus::Completed => return Ok(decode_completed(existing)?),
                StepStatus::Failed => return Err(decode_failed(existing)),
                StepStatus::Stalled => {
                    // The scheduler promotes expired stalled steps before
                    // handing the task to replay, whether the step is
                    // sleeping out a retry backoff or still within its
                    // `sleep_until`. Either way, seeing one here means this
                    // pass got ahead of that promotion (or lost a race with
                    // a concurrent pick); suspend and let the next pass
                    // retry rather than double-executing the step body.
                    return Err(ExecutionError::Suspend);
                }
                StepStatus::Waiting => return Err(ExecutionError::Suspend),
                StepStatus::Running | StepStatus::Pending => {}
            }
        }

        let attempt: u32 = self.steps.get(&name).map(|s| s.runs as u32 + 1).unwrap_or(1);

        self.storage
            .record_step(
                self.task.id,
                &name,
                StepFields {
                    status: StepStatus::Running,
                    discovered_on: self.task.loop_count,
                    ..Default::default()
                },
            )
            .await?;

        let handle = CancelHandle { signal: self.cancel };
        let body = f(handle);

        let outcome = match options.timeout {
            Some(duration) => tokio::select! {
                result = tokio::time::timeout(duration, body) => match result {
                    Ok(result) => result,
                    Err(_) => Err(StepError::new("step timed out")),
                },
                _ = handle.cancelled() => return Err(ExecutionError::Suspend),
            },
            None => tokio::select! {
                result = body => result,
                _ = handle.cancelled() => return Err(ExecutionError::Suspend),
            },
        };

        match outcome {
            Ok(value) => {
                let data = serde_json::to_value(&value).map_err(|e| {
                    ExecutionError::NonRecoverable(SerializedError::non_recoverable(e.to_string()))
                })?;
                self.storage
                    .record_step(
                        self.task.id,
                        &name,
                        StepFields {
                            status: StepStatus::Completed,
                            data: Some(data),
                            discovered_on: self.task.loop_count,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(value)
            }
            Err(step_err) => {
                let serialized: SerializedError = step_err.into();
                let can_retry = !serialized.non_recoverable && !self.is_cancelled() && attempt <= options.retry;

                if !can_retry {
                    self.storage
                        .record_step(
                            self.task.id,
                            &name,
                            StepFields {
                                status: StepStatus::Failed,
                                data: Some(serde_json::to_value(&serialized).expect("SerializedError serializes")),
                                discovered_on: self.task.loop_count,
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Err(if serialized.non_recoverable {
                        ExecutionError::NonRecoverable(serialized)
                    } else {
                        ExecutionError::Transient(serialized)
                    });
                }

                let delay = options.backoff.delay_for(attempt);
                let fields = if delay.is_zero() {
                    StepFields {
                        status: StepStatus::Pending,
                        data: Some(serde_json::to_value(&serialized).expect("SerializedError serializes")),
                        discovered_on: self.task.loop_count,
                        ..Default::default()
                    }
                } else {
                    StepFields {
                        status: StepStatus::Stalled,
                        next_status: Some(StepStatus::Pending),
                        sleep_for: Some(delay.as_secs_f64()),
                        data: Some(serde_json::to_value(&serialized).expect("SerializedError serializes")),
                        discovered_on: self.task.loop_count,
                        ..Default::default()
                    }
                };
                self.storage.record_step(self.task.id, &name, fields).await?;
                Err(ExecutionError::Suspend)
            }
        }
    }

    /// Suspend until `ms` milliseconds have elapsed since this step was
    /// first reached.
    pub async fn sleep(&self, ms: u64) -> Result<(), ExecutionError> {
        let name = self.next_name(StepNamespace::System, "sleep");
        if self.is_cancelled() {
            return Err(ExecutionError::Suspend);
        }
        if let Some(existing) = self.steps.get(&name) {
            return match existing.status() {
                StepStatus::Completed => Ok(()),
                _ => Err(ExecutionError::Suspend),
            };
        }
        self.storage
            .record_step(
                self.task.id,
                &name,
                StepFields {
                    status: StepStatus::Stalled,
                    next_status: Some(StepStatus::Completed),
                    sleep_for: Some(ms as f64 / 1000.0),
                    discovered_on: self.task.loop_count,
                    ..Default::default()
                },
            )
            .await?;
        Err(ExecutionError::Suspend)
    }

    /// Suspend until an event matching `filter` is recorded at `key`.
    pub async fn wait_for(&self, key: EventKey, filter: Value, options: WaitOptions) -> Result<Value, ExecutionError> {
        let name = self.next_name(StepNamespace::System, "wait_for");
        if let Some(existing) = self.steps.get(&name) {
            return match existing.status() {
                StepStatus::Completed => decode_completed(existing),
                StepStatus::Failed => Err(ExecutionError::Timeout),
                StepStatus::Waiting if existing.timeout_at.is_some_and(|at| at <= now_secs()) => {
                    self.storage
                        .record_step(
                            self.task.id,
                            &name,
                            StepFields {
                                status: StepStatus::Failed,
                                data: Some(
                                    serde_json::to_value(SerializedError::new("timed out waiting for an event"))
                                        .expect("SerializedError serializes"),
                                ),
                                discovered_on: self.task.loop_count,
                                ..Default::default()
                            },
                        )
                        .await?;
                    Err(ExecutionError::Timeout)
                }
                _ => Err(ExecutionError::Suspend),
            };
        }
        if self.is_cancelled() {
            return Err(ExecutionError::Suspend);
        }
        self.storage
            .record_step(
                self.task.id,
                &name,
                StepFields {
                    status: StepStatus::Waiting,
                    wait_for: Some(key.to_string()),
                    wait_filter: Some(filter),
                    wait_retroactive: options.retroactive,
                    timeout: options.timeout_secs,
                    discovered_on: self.task.loop_count,
                    ..Default::default()
                },
            )
            .await?;
        Err(ExecutionError::Suspend)
    }

    /// Start `job` and suspend until it settles, surfacing its result or
    /// re-throwing its error. Idempotent: the dispatch and the wait are
    /// each checkpointed under their own system step, so re-entering
    /// `invoke` after a restart neither re-dispatches nor re-waits.
    pub async fn invoke(&self, job: &str, input: Value, options: WaitOptions) -> Result<Value, ExecutionError> {
        self.dispatch(job, input.clone()).await?;
        let settled = self.wait_for(EventKey::job(job, "settled"), input, options).await?;

        if let Some(reason) = settled.get("reason") {
            return Err(ExecutionError::Cancelled { reason: reason.clone() });
        }
        if let Some(error) = settled.get("error") {
            let serialized: SerializedError =
                serde_json::from_value(error.clone()).unwrap_or_else(|_| SerializedError::new("invoked job failed"));
            return Err(if serialized.non_recoverable {
                ExecutionError::NonRecoverable(serialized)
            } else {
                ExecutionError::Transient(serialized)
            });
        }
        Ok(settled.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Start `job` with `input`, without waiting for it to settle.
    pub async fn dispatch(&self, job: &str, input: Value) -> Result<(), ExecutionError> {
        let job = job.to_string();
        let dispatcher = self.dispatcher;
        let name = self.next_name(StepNamespace::System, "dispatch");
        self.run_named(name, RunOptions { retry: 0, backoff: Backoff::default(), timeout: None }, move |_cancel| async move {
            dispatcher.dispatch(&job, input).await.map_err(|e| match e {
                ExecutionError::Transient(e) | ExecutionError::NonRecoverable(e) => e.into(),
                other => StepError::new(other.to_string()),
            })
        })
        .await
    }

    /// Request cancellation of a running job instance.
    pub async fn cancel(&self, job: &str, input: Value, reason: Value) -> Result<(), ExecutionError> {
        let job = job.to_string();
        let dispatcher = self.dispatcher;
        let name = self.next_name(StepNamespace::System, "cancel");
        self.run_named(name, RunOptions { retry: 0, backoff: Backoff::default(), timeout: None }, move |_cancel| async move {
            dispatcher.cancel(&job, input, reason).await.map_err(|e| match e {
                ExecutionError::Transient(e) | ExecutionError::NonRecoverable(e) => e.into(),
                other => StepError::new(other.to_string()),
            })
        })
        .await
    }
}

fn decode_completed<T: DeserializeOwned>(step: &Step) -> Result<T, ExecutionError> {
    let raw = step
        .data
        .as_deref()
        .ok_or_else(|| ExecutionError::NonRecoverable(SerializedError::non_recoverable("completed step missing data")))?;
    serde_json::from_str(raw)
        .map_err(|e| ExecutionError::NonRecoverable(SerializedError::non_recoverable(e.to_string())))
}

fn decode_failed(step: &Step) -> ExecutionError {
    let serialized = step
        .data
        .as_deref()
        .and_then(|raw| serde_json::from_str::<SerializedError>(raw).ok())
        .unwrap_or_else(|| SerializedError::new("step failed"));
    if serialized.non_recoverable {
        ExecutionError::NonRecoverable(serialized)
    } else {
        ExecutionError::Transient(serialized)
    }
}
