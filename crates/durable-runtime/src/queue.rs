//! The public `Queue` (§6): binds jobs and pipes to a Storage backend
//! and a running scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use durable_journal::{CancelSignal, Dispatcher, ExecutionError};
use durable_storage::{AddTaskOptions, DebounceOptions, NewTask, RateLimitOptions, Storage, TaskId, ThrottleOptions};
use durable_types::{SerializedError, TaskStatus};
use serde_json::Value;
use tokio::task::JoinSet;

use crate::cron::CronSchedule;
use crate::error::RuntimeError;
use crate::job::Job;
use crate::logger::{Logger, TracingLogger};
use crate::pipe::Pipe;
use crate::registration;
use crate::scheduler::{self, NoopSchedulerHook, SchedulerHook};

struct AtomicBoolSignal(Arc<AtomicBool>);

impl CancelSignal for AtomicBoolSignal {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CancelRegistry {
    flags: Mutex<HashMap<TaskId, Arc<AtomicBool>>>,
    reasons: Mutex<HashMap<TaskId, Value>>,
}

impl CancelRegistry {
    fn get_or_create(&self, task_id: TaskId) -> Arc<AtomicBoolSignal> {
        let mut map = self.flags.lock().expect("cancel registry poisoned");
        let flag = map.entry(task_id).or_insert_with(|| Arc::new(AtomicBool::new(false))).clone();
        Arc::new(AtomicBoolSignal(flag))
    }

    /// Trip the cancel flag for a task and remember why, so a running
    /// execution that later suspends instead of unwinding can still be
    /// resolved as cancelled with the original reason.
    ///
    /// Creates the flag pre-tripped if it doesn't exist yet, rather than
    /// only updating an existing one: `cancel_instance` can observe a
    /// task's row as already `running` and call `trip` before
    /// `execute_once` reaches `get_or_create` for the same task, and a
    /// plain "update if present" would silently drop that cancellation.
    fn trip(&self, task_id: TaskId, reason: Value) {
        let mut flags = self.flags.lock().expect("cancel registry poisoned");
        flags.entry(task_id).or_insert_with(|| Arc::new(AtomicBool::new(false))).store(true, Ordering::SeqCst);
        drop(flags);
        self.reasons.lock().expect("cancel registry poisoned").insert(task_id, reason);
    }

    pub(crate) fn reason(&self, task_id: TaskId) -> Option<Value> {
        self.reasons.lock().expect("cancel registry poisoned").get(&task_id).cloned()
    }

    fn remove(&self, task_id: TaskId) {
        self.flags.lock().expect("cancel registry poisoned").remove(&task_id);
        self.reasons.lock().expect("cancel registry poisoned").remove(&task_id);
    }
}

/// The `Dispatcher` seam the execution context uses for `invoke`/
/// `dispatch`/`cancel`, bound weakly to avoid a reference cycle with
/// the Queue the jobs live on.
pub(crate) struct QueueDispatcher(pub(crate) Weak<QueueInner>);

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(&self, job: &str, input: Value) -> Result<(), ExecutionError> {
        let inner = self.0.upgrade().ok_or_else(|| {
            ExecutionError::NonRecoverable(SerializedError::non_recoverable("queue dropped before dispatch"))
        })?;
        inner
            .trigger_job(job, input)
            .await
            .map_err(|e| ExecutionError::Transient(SerializedError::new(e.to_string())))?;
        Ok(())
    }

    async fn cancel(&self, job: &str, input: Value, reason: Value) -> Result<(), ExecutionError> {
        let inner = self.0.upgrade().ok_or_else(|| {
            ExecutionError::NonRecoverable(SerializedError::non_recoverable("queue dropped before cancel"))
        })?;
        inner
            .cancel_instance(job, input, reason)
            .await
            .map_err(|e| ExecutionError::Transient(SerializedError::new(e.to_string())))?;
        Ok(())
    }
}

/// Result of [`Queue::trigger`] / [`QueueInner::trigger_job`].
#[derive(Clone, Debug)]
pub struct TriggerOutcome {
    pub task: durable_storage::Task,
    /// Set when a `rate_limit` group already had a task created within
    /// its window: the dispatch was not inserted, and the caller should
    /// retry after this many milliseconds.
    pub rate_limited_retry_ms: Option<u64>,
}

pub struct QueueInner {
    pub(crate) id: String,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) jobs: HashMap<String, Arc<Job>>,
    pipe_triggers: HashMap<String, Vec<(String, Option<crate::pipe::Transform>)>>,
    logger: Arc<dyn Logger>,
    pub(crate) cron_schedules: HashMap<String, Arc<dyn CronSchedule>>,
    pub(crate) scheduler_hook: Arc<dyn SchedulerHook>,
    pub(crate) notify: tokio::sync::Notify,
    /// A `tokio::sync::Mutex`, not `std::sync::Mutex`: `close()` holds
    /// the guard across `join_next().await`, and an async mutex yields
    /// to the executor instead of blocking the OS thread while it does.
    pub(crate) in_flight: tokio::sync::Mutex<JoinSet<()>>,
    pub(crate) closed: AtomicBool,
    pub(crate) cancellations: CancelRegistry,
}

/// Builder for [`Queue`], mirroring the teacher's `EngineConfig`
/// builder-then-`build_*` shape.
#[derive(Default)]
pub struct QueueConfig {
    logger: Option<Arc<dyn Logger>>,
    cron_factory: Option<crate::cron::CronFactory>,
    scheduler_hook: Option<Arc<dyn SchedulerHook>>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Supply how a job's `cron` option string resolves to a live
    /// [`CronSchedule`]. Defaults to [`crate::cron::cron_feature_factory`]
    /// when the `cron` feature is enabled; without it (or without this
    /// call), jobs naming a `cron` option simply never fire on a
    /// schedule — §1 treats the cron driver itself as a host
    /// collaborator.
    pub fn cron_factory(mut self, factory: crate::cron::CronFactory) -> Self {
        self.cron_factory = Some(factory);
        self
    }

    pub fn scheduler_hook(mut self, hook: Arc<dyn SchedulerHook>) -> Self {
        self.scheduler_hook = Some(hook);
        self
    }

    pub fn build(
        self,
        id: impl Into<String>,
        jobs: Vec<Job>,
        pipes: Vec<Pipe>,
        storage: Arc<dyn Storage>,
    ) -> Result<Queue, RuntimeError> {
        let id = id.into();
        let mut jobs_by_id = HashMap::new();
        for job in jobs {
            if jobs_by_id.contains_key(&job.id) {
                return Err(RuntimeError::DuplicateJob(job.id));
            }
            jobs_by_id.insert(job.id.clone(), Arc::new(job));
        }

        let mut pipe_ids = std::collections::HashSet::new();
        for pipe in &pipes {
            if !pipe_ids.insert(pipe.id.clone()) {
                return Err(RuntimeError::DuplicatePipe(pipe.id.clone()));
            }
        }

        let mut pipe_triggers: HashMap<String, Vec<(String, Option<crate::pipe::Transform>)>> = HashMap::new();
        for job in jobs_by_id.values() {
            for trigger in &job.options.triggers {
                pipe_triggers
                    .entry(trigger.key())
                    .or_default()
                    .push((job.id.clone(), trigger.transform().cloned()));
            }
        }

        #[cfg_attr(not(feature = "cron"), allow(unused_mut))]
        let mut cron_factory = self.cron_factory;
        #[cfg(feature = "cron")]
        {
            cron_factory = cron_factory.or_else(|| Some(crate::cron::cron_feature_factory()));
        }

        let mut cron_schedules: HashMap<String, Arc<dyn CronSchedule>> = HashMap::new();
        for job in jobs_by_id.values() {
            let Some(expr) = &job.options.cron else { continue };
            match &cron_factory {
                Some(factory) => match factory(expr) {
                    Ok(schedule) => {
                        cron_schedules.insert(job.id.clone(), schedule);
                    }
                    Err(error) => {
                        tracing::error!(job = %job.id, cron = %expr, %error, "failed to parse cron expression")
                    }
                },
                None => tracing::warn!(
                    job = %job.id,
                    cron = %expr,
                    "job has a cron option but no CronFactory is configured (enable the `cron` feature or call QueueConfig::cron_factory); it will never fire on a schedule"
                ),
            }
        }

        let inner = Arc::new(QueueInner {
            id,
            storage,
            jobs: jobs_by_id,
            pipe_triggers,
            logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
            cron_schedules,
            scheduler_hook: self.scheduler_hook.unwrap_or_else(|| Arc::new(NoopSchedulerHook)),
            notify: tokio::sync::Notify::new(),
            in_flight: tokio::sync::Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            cancellations: CancelRegistry::default(),
        });

        if !inner.cron_schedules.is_empty() {
            let cron_inner = inner.clone();
            tokio::spawn(crate::cron::run_loop(cron_inner));
        }

        let recovery = inner.clone();
        tokio::spawn(async move {
            match recovery.storage.recover_stale_running(&recovery.id).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(queue = %recovery.id, recovered = n, "reset stale running tasks at startup"),
                Err(error) => tracing::error!(queue = %recovery.id, %error, "recover_stale_running failed"),
            }
            recovery.notify.notify_one();
        });

        let scheduler_inner = inner.clone();
        tokio::spawn(scheduler::run_loop(scheduler_inner));

        Ok(Queue(inner))
    }
}

/// A running task queue: binds a set of [`Job`]/[`Pipe`] definitions to
/// a [`Storage`] backend and drives the scheduler loop for its
/// lifetime.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

impl Queue {
    pub fn new(
        id: impl Into<String>,
        jobs: Vec<Job>,
        pipes: Vec<Pipe>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, RuntimeError> {
        QueueConfig::new().build(id, jobs, pipes, storage)
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Start one execution of `job` with `input`. Returns the resulting
    /// task row (which may already be terminal, for a deduplicated
    /// re-trigger) and, if `job` has a `rate_limit` and its window hasn't
    /// elapsed, the number of milliseconds the caller should wait before
    /// retrying — in that case no new task row is inserted (§8).
    pub async fn trigger(&self, job: &str, input: Value) -> Result<TriggerOutcome, RuntimeError> {
        self.0.trigger_job(job, input).await
    }

    /// Request cancellation of a running or queued instance of `job`.
    pub async fn cancel(&self, job: &str, input: Value, reason: Value) -> Result<(), RuntimeError> {
        self.0.cancel_instance(job, input, reason).await
    }

    /// Append an event to `pipe` and notify every job that names it in
    /// `triggers`.
    pub async fn dispatch_pipe(&self, pipe: &str, input: Value) -> Result<(), RuntimeError> {
        self.0.dispatch_pipe(pipe, input).await
    }

    /// Stop accepting new work and wait for every in-flight task
    /// execution to settle.
    pub async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.notify.notify_one();
        loop {
            let next = self.0.in_flight.lock().await.join_next().await;
            if next.is_none() {
                break;
            }
        }
    }
}

impl QueueInner {
    /// Fire a job lifecycle listener and append the matching `events`
    /// row in the same call, so a sibling task's `wait_for(job, event)`
    /// (and `invoke`'s own `job/<id>/settled` wait) can observe it
    /// through the normal event-matcher path (§4.5) rather than only
    /// the in-process listener.
    pub(crate) async fn emit_lifecycle(&self, job: &Job, event: &'static str, input: Value, payload: Value) {
        job.emit(event, &payload);
        let key = durable_types::EventKey::job(&job.id, event).to_string();
        if let Err(error) = self.storage.record_event(&self.id, &key, input, payload).await {
            tracing::error!(queue = %self.id, job = %job.id, event, %error, "record_event failed for job lifecycle event");
        }
    }

    pub(crate) async fn trigger_job(&self, job_id: &str, input: Value) -> Result<TriggerOutcome, RuntimeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::QueueClosed(self.id.clone()));
        }
        let job = self.jobs.get(job_id).ok_or_else(|| RuntimeError::UnknownJob(job_id.to_string()))?;

        let key = durable_types::compute_key(&input);

        self.emit_lifecycle(job, "trigger", input.clone(), serde_json::json!({ "input": input })).await;

        let debounce = job.options.debounce.as_ref().map(|spec| DebounceOptions {
            id: Job::group_key(&spec.by, job_id, &input),
            delay_ms: spec.delay.as_millis() as u64,
        });
        let throttle = job.options.throttle.as_ref().map(|spec| ThrottleOptions {
            id: Job::group_key(&spec.by, job_id, &input),
            duration_ms: spec.duration.as_millis() as u64,
        });
        let rate_limit = job.options.rate_limit.as_ref().map(|spec| RateLimitOptions {
            id: Job::group_key(&spec.by, job_id, &input),
            window_seconds: spec.window.as_secs(),
        });

        let timeout_at = job.options.timeout.map(|d| now_secs() + d.as_secs_f64());

        let outcome = self
            .storage
            .add_task(
                NewTask {
                    parent_id: None,
                    queue: self.id.clone(),
                    job: job_id.to_string(),
                    key,
                    input,
                    priority: job.options.priority,
                    timeout_at,
                },
                AddTaskOptions { debounce, throttle, rate_limit },
            )
            .await?;

        if let Some(sibling) = &outcome.cancelled_sibling {
            let sibling_input = serde_json::from_str::<Value>(&sibling.input).unwrap_or(Value::Null);
            self.emit_lifecycle(job, "cancel", sibling_input.clone(), serde_json::json!({ "reason": "debounced" })).await;
            self.emit_lifecycle(job, "settled", sibling_input, serde_json::json!({ "reason": "debounced", "task_id": sibling.id })).await;
        }

        if !outcome.inserted && outcome.task.status().is_terminal() {
            self.emit_terminal(job, &outcome.task).await;
        }

        self.notify.notify_one();
        Ok(TriggerOutcome {
            task: outcome.task,
            rate_limited_retry_ms: outcome.rate_limit_retry_ms,
        })
    }

    pub(crate) async fn cancel_instance(&self, job_id: &str, input: Value, reason: Value) -> Result<(), RuntimeError> {
        let job = self.jobs.get(job_id).ok_or_else(|| RuntimeError::UnknownJob(job_id.to_string()))?;
        let key = durable_types::compute_key(&input);

        let Some(task) = self.storage.get_task(&self.id, job_id, &key).await? else {
            return Ok(());
        };
        if task.status().is_terminal() {
            return Ok(());
        }

        self.cancellations.trip(task.id, reason.clone());

        // Re-read after tripping the flag rather than branching on the
        // snapshot above: the scheduler can pick this task and flip it
        // to `running` in the gap between that snapshot and here, and
        // resolving it straight to `cancelled` while it's actually
        // running would race the execution's own resolve of the same
        // transition. Once it's running, the tripped flag is the only
        // path: `execute_once` observes it and settles the task itself.
        let task = self.storage.get_task(&self.id, job_id, &key).await?.unwrap_or(task);
        if task.status().is_terminal() {
            return Ok(());
        }

        if task.status() != TaskStatus::Running {
            self.storage.resolve_task(task.id, TaskStatus::Cancelled, Some(reason.clone())).await?;
            let task_input = serde_json::from_str::<Value>(&task.input).unwrap_or(Value::Null);
            self.emit_lifecycle(job, "cancel", task_input.clone(), serde_json::json!({ "reason": reason })).await;
            self.emit_lifecycle(job, "settled", task_input, serde_json::json!({ "reason": reason })).await;
            // The task is terminal and execute_once will never run for
            // it, so nothing else will call cancellations.remove.
            self.cancellations.remove(task.id);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) async fn dispatch_pipe(&self, pipe_id: &str, input: Value) -> Result<(), RuntimeError> {
        let key = durable_types::EventKey::pipe(pipe_id).to_string();
        self.storage
            .record_event(&self.id, &key, input.clone(), serde_json::json!({ "input": input }))
            .await?;
        self.notify.notify_one();

        if let Some(triggers) = self.pipe_triggers.get(&key) {
            for (job_id, transform) in triggers.clone() {
                let job_input = match &transform {
                    Some(transform) => transform(input.clone()),
                    None => input.clone(),
                };
                if let Err(error) = self.trigger_job(&job_id, job_input).await {
                    self.logger.error("pipe-triggered job dispatch failed", &serde_json::json!({ "job": job_id, "error": error.to_string() }));
                }
            }
        }
        Ok(())
    }

    async fn emit_terminal(&self, job: &Job, task: &durable_storage::Task) {
        let data = task
            .data
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .unwrap_or(Value::Null);
        let task_input = serde_json::from_str::<Value>(&task.input).unwrap_or(Value::Null);
        match task.status() {
            TaskStatus::Completed => {
                self.emit_lifecycle(job, "success", task_input.clone(), serde_json::json!({ "result": data })).await;
                self.emit_lifecycle(job, "settled", task_input, serde_json::json!({ "result": data })).await;
            }
            TaskStatus::Failed => {
                self.emit_lifecycle(job, "error", task_input.clone(), serde_json::json!({ "error": data })).await;
                self.emit_lifecycle(job, "settled", task_input, serde_json::json!({ "error": data })).await;
            }
            TaskStatus::Cancelled => {
                self.emit_lifecycle(job, "cancel", task_input.clone(), serde_json::json!({ "reason": data })).await;
                self.emit_lifecycle(job, "settled", task_input, serde_json::json!({ "reason": data })).await;
            }
            _ => {}
        }
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Bind `queue` as the ambient current queue for the duration of `fut`
/// (§9 registration context), letting code inside it call
/// `other_job.dispatch(...)`-style helpers without an explicit handle.
pub async fn with_current<F, T>(queue: &Queue, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    registration::bind(Arc::downgrade(&queue.0), fut).await
}

pub fn current() -> Option<Queue> {
    registration::current().map(Queue)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use durable_journal::{RunOptions, StepError, WaitOptions};
    use durable_storage::SqliteStorage;
    use durable_types::StepStatus;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::job::{DebounceSpec, JobOptions};

    async fn storage() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::in_memory().await.expect("in-memory sqlite"))
    }

    /// Poll a task by its natural key until `pred` is satisfied, or panic
    /// once `budget` elapses. The scheduler runs on its own background
    /// loop, so tests observe its progress this way rather than by
    /// gating on internal scheduler hooks.
    async fn poll_task_until<F>(
        storage: &Arc<dyn Storage>,
        queue: &str,
        job: &str,
        key: &str,
        budget: StdDuration,
        mut pred: F,
    ) -> durable_storage::Task
    where
        F: FnMut(&durable_storage::Task) -> bool,
    {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(task) = storage.get_task(queue, job, key).await.expect("get_task") {
                if pred(&task) {
                    return task;
                }
            }
            if Instant::now() >= deadline {
                panic!("condition not satisfied within {budget:?}");
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }

    async fn poll_terminal(
        storage: &Arc<dyn Storage>,
        queue: &str,
        job: &str,
        key: &str,
        budget: StdDuration,
    ) -> durable_storage::Task {
        poll_task_until(storage, queue, job, key, budget, |task| task.status().is_terminal()).await
    }

    async fn poll_step_recorded(storage: &Arc<dyn Storage>, task_id: TaskId, step: &str, budget: StdDuration) {
        let deadline = Instant::now() + budget;
        loop {
            let steps = storage.list_steps(task_id).await.expect("list_steps");
            if steps.iter().any(|s| s.step == step) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("step {step} was never recorded within {budget:?}");
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn trigger_dedupes_and_runs_the_step_body_exactly_once() {
        let storage = storage().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_job = calls.clone();

        let job = Job::new("counter", JobOptions::default(), move |ctx, input| {
            let calls = calls_for_job.clone();
            Box::pin(async move {
                let _: () = ctx
                    .run("bump", RunOptions::default(), move |_cancel| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, AtomicOrdering::SeqCst);
                            Ok::<_, StepError>(())
                        }
                    })
                    .await?;
                Ok(input)
            })
        });

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        let input = json!({ "a": 1 });
        let key = durable_types::compute_key(&input);

        queue.trigger("counter", input.clone()).await.expect("first trigger");
        queue.trigger("counter", input.clone()).await.expect("second trigger (dedup)");

        let task = poll_terminal(&storage, "q", "counter", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        queue.close().await;
    }

    #[tokio::test]
    async fn debounce_cancels_unstarted_siblings_and_settles_the_latest() {
        let storage = storage().await;
        let mut options = JobOptions::default();
        options.debounce = Some(DebounceSpec { by: None, delay: StdDuration::from_millis(30) });
        let job = Job::new("debounced", options, |_ctx, input| Box::pin(async move { Ok(input) }));

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");

        queue.trigger("debounced", json!({ "a": 1 })).await.expect("trigger 1");
        queue.trigger("debounced", json!({ "a": 2 })).await.expect("trigger 2");
        queue.trigger("debounced", json!({ "a": 3 })).await.expect("trigger 3");

        let key = durable_types::compute_key(&json!({ "a": 3 }));
        let task = poll_terminal(&storage, "q", "debounced", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Completed);

        let events = storage.list_events("q", durable_storage::ListCursor::default()).await.expect("list_events");
        let cancelled = events.iter().filter(|e| e.key == "job/debounced/cancel").count();
        assert_eq!(cancelled, 2, "both earlier, unstarted siblings should have been cancelled");
    }

    #[tokio::test]
    async fn wait_for_resolves_on_the_matching_pipe_event() {
        let storage = storage().await;
        let job = Job::new("listener", JobOptions::default(), |ctx, _input| {
            Box::pin(async move {
                ctx.wait_for(durable_types::EventKey::pipe("p"), json!({ "num": 42 }), WaitOptions::default()).await
            })
        });

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        queue.trigger("listener", json!({})).await.expect("trigger");

        queue.dispatch_pipe("p", json!({ "num": 1 })).await.expect("non-matching dispatch");
        queue.dispatch_pipe("p", json!({ "num": 42 })).await.expect("matching dispatch");

        let key = durable_types::compute_key(&json!({}));
        let task = poll_terminal(&storage, "q", "listener", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Completed);

        let data: serde_json::Value = serde_json::from_str(task.data.as_deref().unwrap()).expect("task data");
        assert_eq!(data["input"], json!({ "num": 42 }));
    }

    #[tokio::test]
    async fn invoke_returns_the_invoked_jobs_result() {
        let storage = storage().await;
        let callee = Job::new("callee", JobOptions::default(), |_ctx, input| {
            Box::pin(async move {
                let n = input["in"].as_i64().unwrap_or(0);
                Ok(json!({ "foo": n }))
            })
        });
        let caller = Job::new("caller", JobOptions::default(), |ctx, input| {
            Box::pin(async move {
                let result = ctx.invoke("callee", input.clone(), WaitOptions::default()).await?;
                let n = result["foo"].as_i64().unwrap_or(0);
                Ok(json!({ "bar": n }))
            })
        });

        let queue = Queue::new("q", vec![callee, caller], vec![], storage.clone()).expect("build queue");
        queue.trigger("caller", json!({ "in": 7 })).await.expect("trigger caller");

        let key = durable_types::compute_key(&json!({ "in": 7 }));
        let task = poll_terminal(&storage, "q", "caller", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Completed);

        let data: serde_json::Value = serde_json::from_str(task.data.as_deref().unwrap()).expect("task data");
        assert_eq!(data, json!({ "bar": 7 }));

        queue.close().await;
    }

    #[tokio::test]
    async fn cancelling_a_sleeping_task_settles_it_without_ever_waking_the_step() {
        let storage = storage().await;
        let job = Job::new("sleeper", JobOptions::default(), |ctx, input| {
            Box::pin(async move {
                ctx.sleep(60_000).await?;
                Ok(input)
            })
        });

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        let task = queue.trigger("sleeper", json!({ "a": 1 })).await.expect("trigger").task;

        poll_step_recorded(&storage, task.id, "system/sleep#0", StdDuration::from_secs(5)).await;

        queue.cancel("sleeper", json!({ "a": 1 }), json!({ "type": "explicit" })).await.expect("cancel");

        let key = durable_types::compute_key(&json!({ "a": 1 }));
        let resolved = poll_terminal(&storage, "q", "sleeper", &key, StdDuration::from_secs(5)).await;
        assert_eq!(resolved.status(), TaskStatus::Cancelled);

        let data: serde_json::Value = serde_json::from_str(resolved.data.as_deref().unwrap()).expect("task data");
        assert_eq!(data["type"], json!("explicit"));

        let steps = storage.list_steps(task.id).await.expect("list_steps");
        let sleep_step = steps.iter().find(|s| s.step == "system/sleep#0").expect("sleep step recorded");
        assert_eq!(sleep_step.status(), StepStatus::Stalled, "cancellation settles the task, not the blocked step");
    }

    #[tokio::test]
    async fn cancelling_a_task_aborts_an_in_flight_run_body_instead_of_waiting_for_it() {
        let storage = storage().await;
        let body_finished = Arc::new(AtomicUsize::new(0));
        let body_finished_for_job = body_finished.clone();

        let job = Job::new("long-runner", JobOptions::default(), move |ctx, input| {
            let body_finished = body_finished_for_job.clone();
            Box::pin(async move {
                let _: () = ctx
                    .run("slow", RunOptions::default(), move |_cancel| {
                        let body_finished = body_finished.clone();
                        async move {
                            // A body that never itself checks `_cancel` still
                            // gets aborted: `run` races it against the
                            // cancellation signal regardless.
                            tokio::time::sleep(StdDuration::from_secs(60)).await;
                            body_finished.fetch_add(1, AtomicOrdering::SeqCst);
                            Ok::<_, StepError>(())
                        }
                    })
                    .await?;
                Ok(input)
            })
        });

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        let task = queue.trigger("long-runner", json!({ "a": 1 })).await.expect("trigger").task;

        poll_step_recorded(&storage, task.id, "user/slow#0", StdDuration::from_secs(5)).await;

        queue.cancel("long-runner", json!({ "a": 1 }), json!({ "type": "explicit" })).await.expect("cancel");

        let key = durable_types::compute_key(&json!({ "a": 1 }));
        let resolved = poll_terminal(&storage, "q", "long-runner", &key, StdDuration::from_secs(5)).await;
        assert_eq!(resolved.status(), TaskStatus::Cancelled);
        assert_eq!(
            body_finished.load(AtomicOrdering::SeqCst),
            0,
            "the step body must be aborted on cancellation, not left to run to completion"
        );
    }

    #[tokio::test]
    async fn input_validator_fails_the_task_non_recoverably_without_running_the_body() {
        let storage = storage().await;
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_for_job = ran.clone();

        let mut options = JobOptions::default();
        options.input = Some(Arc::new(|input: &serde_json::Value| {
            if input.get("a").is_some() {
                Ok(())
            } else {
                Err("missing field `a`".to_string())
            }
        }));
        let job = Job::new("validated", options, move |_ctx, input| {
            let ran = ran_for_job.clone();
            Box::pin(async move {
                ran.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(input)
            })
        });

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        queue.trigger("validated", json!({ "b": 1 })).await.expect("trigger");

        let key = durable_types::compute_key(&json!({ "b": 1 }));
        let task = poll_terminal(&storage, "q", "validated", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0, "the job body must not run when input validation fails");

        let data: serde_json::Value = serde_json::from_str(task.data.as_deref().unwrap()).expect("task data");
        assert_eq!(data["non_recoverable"], json!(true));

        queue.close().await;
    }

    #[tokio::test]
    async fn output_validator_fails_a_task_that_would_otherwise_complete() {
        let storage = storage().await;
        let mut options = JobOptions::default();
        options.output = Some(Arc::new(|output: &serde_json::Value| {
            if output.get("total").is_some() {
                Ok(())
            } else {
                Err("missing field `total`".to_string())
            }
        }));
        let job = Job::new("bad-output", options, |_ctx, _input| Box::pin(async move { Ok(json!({ "wrong": 1 })) }));

        let queue = Queue::new("q", vec![job], vec![], storage.clone()).expect("build queue");
        queue.trigger("bad-output", json!({})).await.expect("trigger");

        let key = durable_types::compute_key(&json!({}));
        let task = poll_terminal(&storage, "q", "bad-output", &key, StdDuration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Failed);

        queue.close().await;
    }

    struct EveryTick;

    impl crate::cron::CronSchedule for EveryTick {
        fn next_fire_after(&self, after: chrono::DateTime<chrono::Utc>) -> Option<chrono::DateTime<chrono::Utc>> {
            Some(after)
        }
    }

    #[tokio::test]
    async fn cron_scheduled_job_fires_without_an_explicit_trigger() {
        let storage = storage().await;
        let mut options = JobOptions::default();
        options.cron = Some("every-tick".into());
        let job = Job::new("ticker", options, |_ctx, input| Box::pin(async move { Ok(input) }));

        let factory: crate::cron::CronFactory = Arc::new(|_expr: &str| Ok(Arc::new(EveryTick) as Arc<dyn CronSchedule>));
        let queue = QueueConfig::new()
            .cron_factory(factory)
            .build("q", vec![job], vec![], storage.clone())
            .expect("build queue");

        let deadline = Instant::now() + StdDuration::from_secs(5);
        loop {
            let events = storage.list_events("q", durable_storage::ListCursor::default()).await.expect("list_events");
            if events.iter().any(|e| e.key == "job/ticker/trigger") {
                break;
            }
            if Instant::now() >= deadline {
                panic!("cron-scheduled job never fired within 5s");
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        queue.close().await;
    }
}
