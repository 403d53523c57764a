//! The scheduler (§4.4): one loop per Queue, single-consumer of
//! `start_next_task`, driven by three edge triggers — idle-then-added,
//! a running task finishing, and the next-future timer elapsing.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use durable_journal::{CancelSignal, ReplayOutcome};
use durable_storage::Task;
use durable_types::{SerializedError, TaskStatus};
use serde_json::Value;

use crate::queue::{QueueDispatcher, QueueInner};
use crate::registration;

/// Deterministic-test hook around the scheduler's three phases. Every
/// method has a no-op default; production code never implements this
/// itself. Grounded on the same acquire/notify-around-named-components
/// shape as the teacher's wasm engine epoch ticker, generalized to the
/// scheduler's pick/execute/arm-timer cycle.
pub trait SchedulerHook: Send + Sync {
    fn before_pick(&self) {}
    fn after_pick(&self, picked: bool) {
        let _ = picked;
    }
    fn before_execute(&self, task_id: i64) {
        let _ = task_id;
    }
    fn after_execute(&self, task_id: i64) {
        let _ = task_id;
    }
    fn after_tick(&self) {}
}

pub struct NoopSchedulerHook;

impl SchedulerHook for NoopSchedulerHook {}

pub(crate) async fn run_loop(inner: Arc<QueueInner>) {
    loop {
        if inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        inner.scheduler_hook.before_pick();
        match inner.storage.start_next_task(&inner.id).await {
            Ok(Some(picked)) => {
                inner.scheduler_hook.after_pick(true);
                spawn_execution(&inner, picked.task).await;
                if picked.has_more {
                    continue;
                }
            }
            Ok(None) => {
                inner.scheduler_hook.after_pick(false);
            }
            Err(error) => {
                tracing::error!(queue = %inner.id, %error, "start_next_task failed");
            }
        }

        let wait_ms = inner
            .storage
            .next_future_task(&inner.id)
            .await
            .ok()
            .and_then(|next| next.ms);

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = sleep_or_pending(wait_ms) => {}
        }
        inner.scheduler_hook.after_tick();
    }
}

async fn sleep_or_pending(ms: Option<u64>) {
    match ms {
        Some(ms) => tokio::time::sleep(StdDuration::from_millis(ms)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn spawn_execution(inner: &Arc<QueueInner>, task: Task) {
    let weak = Arc::downgrade(inner);
    let inner = inner.clone();
    let fut = async move {
        execute_once(&inner, task).await;
        inner.notify.notify_one();
    };
    inner.in_flight.lock().await.spawn(registration::bind(weak, fut));
}

async fn execute_once(inner: &Arc<QueueInner>, task: Task) {
    inner.scheduler_hook.before_execute(task.id);

    let Some(job) = inner.jobs.get(&task.job).cloned() else {
        tracing::error!(job = %task.job, "picked a task for an unregistered job");
        inner.scheduler_hook.after_execute(task.id);
        return;
    };

    let steps = match inner.storage.list_steps(task.id).await {
        Ok(steps) => steps,
        Err(error) => {
            tracing::error!(task_id = task.id, %error, "list_steps failed; leaving task running for recovery");
            inner.scheduler_hook.after_execute(task.id);
            return;
        }
    };

    let input = serde_json::from_str::<Value>(&task.input).unwrap_or(Value::Null);

    // A task can be picked specifically because its own timeout_at has
    // elapsed (it was otherwise still blocked on a waiting/sleeping
    // step). Resolve it as cancelled rather than replaying into a step
    // that will just suspend again.
    if task.timeout_at.is_some_and(|at| at <= now_secs()) {
        let reason = serde_json::json!({ "type": "timeout" });
        if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Cancelled, Some(reason.clone())).await {
            tracing::error!(task_id = task.id, %error, "resolve_task(Cancelled) failed for elapsed task timeout");
        }
        inner.emit_lifecycle(&job, "cancel", input.clone(), serde_json::json!({ "reason": reason })).await;
        inner.emit_lifecycle(&job, "settled", input, serde_json::json!({ "reason": reason })).await;
        inner.cancellations.remove(task.id);
        inner.scheduler_hook.after_execute(task.id);
        return;
    }

    // Input validation is a pure, stateless check of already-persisted
    // input JSON: it always fails the same way, so unlike a user step it
    // needs no step-level checkpoint to stay idempotent across replays.
    if let Some(validator) = &job.options.input {
        if let Err(message) = validator(&input) {
            fail_non_recoverable(inner, &job, &task, input, message).await;
            inner.scheduler_hook.after_execute(task.id);
            return;
        }
    }

    if task.loop_count <= 1 {
        inner.emit_lifecycle(&job, "start", input.clone(), serde_json::json!({ "input": input })).await;
    }
    inner.emit_lifecycle(&job, "run", input.clone(), serde_json::json!({ "input": input, "loop": task.loop_count })).await;

    let dispatcher = QueueDispatcher(Arc::downgrade(inner));
    let cancel_flag = inner.cancellations.get_or_create(task.id);
    let func = job.func.clone();

    let outcome = durable_journal::replay(
        &task,
        steps,
        inner.storage.as_ref(),
        &dispatcher,
        cancel_flag.as_ref(),
        move |ctx, input| func(ctx, input),
    )
    .await;

    match outcome {
        ReplayOutcome::Completed(value) => {
            if let Some(validator) = &job.options.output {
                if let Err(message) = validator(&value) {
                    fail_non_recoverable(inner, &job, &task, input, message).await;
                    inner.cancellations.remove(task.id);
                    inner.scheduler_hook.after_execute(task.id);
                    return;
                }
            }
            if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Completed, Some(value.clone())).await {
                tracing::error!(task_id = task.id, %error, "resolve_task(Completed) failed");
            }
            inner.emit_lifecycle(&job, "success", input.clone(), serde_json::json!({ "result": value })).await;
            inner.emit_lifecycle(&job, "settled", input, serde_json::json!({ "result": value })).await;
        }
        ReplayOutcome::Failed(error_value) => {
            if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Failed, Some(error_value.clone())).await {
                tracing::error!(task_id = task.id, %error, "resolve_task(Failed) failed");
            }
            inner.emit_lifecycle(&job, "error", input.clone(), serde_json::json!({ "error": error_value })).await;
            inner.emit_lifecycle(&job, "settled", input, serde_json::json!({ "error": error_value })).await;
        }
        ReplayOutcome::Cancelled(reason) => {
            if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Cancelled, Some(reason.clone())).await {
                tracing::error!(task_id = task.id, %error, "resolve_task(Cancelled) failed");
            }
            inner.emit_lifecycle(&job, "cancel", input.clone(), serde_json::json!({ "reason": reason })).await;
            inner.emit_lifecycle(&job, "settled", input, serde_json::json!({ "reason": reason })).await;
        }
        ReplayOutcome::Suspended => {
            if cancel_flag.is_cancelled() {
                let reason = inner.cancellations.reason(task.id).unwrap_or_else(|| serde_json::json!({ "type": "cancelled" }));
                if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Cancelled, Some(reason.clone())).await {
                    tracing::error!(task_id = task.id, %error, "resolve_task(Cancelled) failed after suspend");
                }
                inner.emit_lifecycle(&job, "cancel", input.clone(), serde_json::json!({ "reason": reason })).await;
                inner.emit_lifecycle(&job, "settled", input, serde_json::json!({ "reason": reason })).await;
            } else if let Err(error) = inner.storage.requeue_task(task.id).await {
                tracing::debug!(task_id = task.id, %error, "requeue_task after suspend");
            }
        }
    }

    inner.cancellations.remove(task.id);
    inner.scheduler_hook.after_execute(task.id);
}

/// Resolve `task` as `failed` with a non-recoverable [`SerializedError`]
/// and fire the `error`/`settled` lifecycle pair — the shared tail for
/// input and output schema mismatches (§4.3, §7 kind 2).
async fn fail_non_recoverable(inner: &Arc<QueueInner>, job: &crate::job::Job, task: &Task, input: Value, message: String) {
    let error_value = serde_json::to_value(SerializedError::non_recoverable(message)).unwrap_or(Value::Null);
    if let Err(error) = inner.storage.resolve_task(task.id, TaskStatus::Failed, Some(error_value.clone())).await {
        tracing::error!(task_id = task.id, %error, "resolve_task(Failed) failed for schema validation mismatch");
    }
    inner.emit_lifecycle(job, "error", input.clone(), serde_json::json!({ "error": error_value })).await;
    inner.emit_lifecycle(job, "settled", input, serde_json::json!({ "error": error_value })).await;
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
