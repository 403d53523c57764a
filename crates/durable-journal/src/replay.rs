//! The replay driver: runs a task function once against the execution
//! context and translates its outcome into the one storage action the
//! caller (`durable-runtime`'s scheduler) needs to take next.

use std::future::Future;

use durable_storage::{Step, Storage, Task};
use serde_json::Value;

use crate::ctx::Ctx;
use crate::dispatch::{CancelSignal, Dispatcher};
use crate::error::ExecutionError;

/// What the scheduler should do with a task after one replay pass.
#[derive(Debug)]
pub enum ReplayOutcome {
    /// The function returned; `resolve_task(Completed, result)`.
    Completed(Value),
    /// A step failed without further retries; `resolve_task(Failed, err)`.
    Failed(Value),
    /// The function threw a [`ExecutionError::Cancelled`]; treat as
    /// `resolve_task(Cancelled, reason)`.
    Cancelled(Value),
    /// The function suspended on an in-progress step; `requeue_task` (if
    /// steps remain pending) or leave the task `stalled`/`waiting` as
    /// already recorded by the step that suspended it.
    Suspended,
}

/// Run `job_fn` once against the current snapshot of `task`/`steps`.
///
/// `job_fn` receives the context and the parsed task input and returns
/// the serialized output on success.
pub async fn replay<F, Fut>(
    task: &Task,
    steps: Vec<Step>,
    storage: &dyn Storage,
    dispatcher: &dyn Dispatcher,
    cancel: &dyn CancelSignal,
    job_fn: F,
) -> ReplayOutcome
where
    F: FnOnce(Ctx<'_>, Value) -> Fut,
    Fut: Future<Output = Result<Value, ExecutionError>>,
{
    let ctx = Ctx::new(task, steps, storage, dispatcher, cancel);
    let input = match ctx.input() {
        Ok(input) => input,
        Err(ExecutionError::NonRecoverable(err)) => {
            return ReplayOutcome::Failed(serde_json::to_value(&err).unwrap_or(Value::Null));
        }
        Err(_) => return ReplayOutcome::Suspended,
    };

    match job_fn(ctx, input).await {
        Ok(value) => ReplayOutcome::Completed(value),
        Err(ExecutionError::Suspend) => ReplayOutcome::Suspended,
        Err(ExecutionError::Cancelled { reason }) => ReplayOutcome::Cancelled(reason),
        Err(ExecutionError::Transient(err)) | Err(ExecutionError::NonRecoverable(err)) => {
            ReplayOutcome::Failed(serde_json::to_value(&err).unwrap_or(Value::Null))
        }
        Err(ExecutionError::Timeout) => {
            ReplayOutcome::Failed(serde_json::json!({ "message": "timed out waiting for an event" }))
        }
        Err(ExecutionError::Storage(err)) => {
            tracing::error!(task_id = task.id, error = %err, "storage error during replay");
            ReplayOutcome::Suspended
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use durable_storage::{SqliteStorage, StepFields};
    use durable_types::StepStatus;
    use serde_json::json;

    use super::*;
    use crate::dispatch::NeverCancelled;
    use crate::error::StepError;

    struct NoDispatch;

    #[async_trait]
    impl Dispatcher for NoDispatch {
        async fn dispatch(&self, _job: &str, _input: Value) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn cancel(&self, _job: &str, _input: Value, _reason: Value) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    async fn pending_task(storage: &SqliteStorage, input: Value) -> Task {
        let outcome = storage
            .add_task(
                durable_storage::NewTask {
                    parent_id: None,
                    queue: "default".into(),
                    job: "add-one".into(),
                    key: "k".into(),
                    input,
                    priority: 0,
                    timeout_at: None,
                },
                Default::default(),
            )
            .await
            .unwrap();
        outcome.task
    }

    #[tokio::test]
    async fn completes_immediately_when_the_function_never_suspends() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let task = pending_task(&storage, json!({"n": 41})).await;

        let outcome = replay(&task, vec![], &storage, &NoDispatch, &NeverCancelled, |ctx, input| async move {
            let n = input["n"].as_i64().unwrap();
            let doubled: i64 = ctx
                .run("double", Default::default(), |_cancel| async move { Ok::<_, StepError>(n * 2) })
                .await?;
            Ok(json!({ "doubled": doubled }))
        })
        .await;

        match outcome {
            ReplayOutcome::Completed(value) => assert_eq!(value, json!({"doubled": 82})),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_step_short_circuits_on_the_next_pass() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let task = pending_task(&storage, json!({})).await;

        storage
            .record_step(
                task.id,
                "user/side-effect#0",
                StepFields {
                    status: StepStatus::Completed,
                    data: Some(json!(7)),
                    discovered_on: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let outcome = replay(&task, vec![], &storage, &NoDispatch, &NeverCancelled, |ctx, _input| async {
            let value: i64 = ctx
                .run("side-effect", Default::default(), |_cancel| async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, StepError>(99)
                })
                .await?;
            Ok(json!(value))
        })
        .await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        match outcome {
            ReplayOutcome::Completed(value) => assert_eq!(value, json!(7)),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sleep_suspends_the_first_pass() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let task = pending_task(&storage, json!({})).await;

        let outcome = replay(&task, vec![], &storage, &NoDispatch, &NeverCancelled, |ctx, _input| async move {
            ctx.sleep(60_000).await?;
            Ok(json!(null))
        })
        .await;

        assert!(matches!(outcome, ReplayOutcome::Suspended));
        let steps = storage.list_steps(task.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status(), StepStatus::Stalled);
    }

    #[tokio::test]
    async fn non_recoverable_failure_stops_retrying() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let task = pending_task(&storage, json!({})).await;

        let outcome = replay(&task, vec![], &storage, &NoDispatch, &NeverCancelled, |ctx, _input| async move {
            let _: i64 = ctx
                .run(
                    "validate",
                    crate::ctx::RunOptions { retry: 5, backoff: Default::default(), timeout: None },
                    |_cancel| async { Err(StepError::non_recoverable("bad input")) },
                )
                .await?;
            Ok(json!(null))
        })
        .await;

        match outcome {
            ReplayOutcome::Failed(value) => assert_eq!(value["message"], json!("bad input")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

}
