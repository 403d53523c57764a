//! Storage: persistent state of tasks, steps, and events, and the
//! atomic transactions that advance them (§4.1).

pub mod error;
pub mod model;
pub mod schema;
pub mod sqlite;

pub use error::{map_sqlx_error, StorageError};
pub use model::{Event, Step, StepId, Task, TaskId};
pub use sqlite::{SqliteStorage, SqliteStorageConfig};

use async_trait::async_trait;
use durable_types::{StepStatus, TaskStatus};
use serde_json::Value;

/// Fields needed to insert a new task row. `status` is not included: the
/// backend derives it from whether `debounce`/`throttle` are set
/// (§4.1 `add_task`).
#[derive(Clone, Debug)]
pub struct NewTask {
    pub parent_id: Option<TaskId>,
    pub queue: String,
    pub job: String,
    pub key: String,
    pub input: Value,
    pub priority: i64,
    pub timeout_at: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct DebounceOptions {
    pub id: String,
    pub delay_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ThrottleOptions {
    pub id: String,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct RateLimitOptions {
    pub id: String,
    pub window_seconds: u64,
}

#[derive(Clone, Debug, Default)]
pub struct AddTaskOptions {
    pub debounce: Option<DebounceOptions>,
    pub throttle: Option<ThrottleOptions>,
    pub rate_limit: Option<RateLimitOptions>,
}

/// Result of `add_task`: either the row existed already (idempotent
/// dedup), was newly inserted, was rate-limited away, or superseded an
/// earlier debounce sibling.
#[derive(Clone, Debug)]
pub struct AddTaskOutcome {
    pub task: Task,
    pub inserted: bool,
    pub rate_limit_retry_ms: Option<u64>,
    pub cancelled_sibling: Option<Task>,
}

/// Fields for `record_step`, upserted on `(task_id, step)`.
///
/// `sleep_for`/`timeout` are relative seconds on write and are stored as
/// absolute timestamps; `wait_retroactive = true` stores `wait_from = 0`.
#[derive(Clone, Debug, Default)]
pub struct StepFields {
    pub status: StepStatus,
    pub next_status: Option<StepStatus>,
    pub sleep_for: Option<f64>,
    pub timeout: Option<f64>,
    pub wait_for: Option<String>,
    pub wait_filter: Option<Value>,
    pub wait_retroactive: bool,
    pub data: Option<Value>,
    pub discovered_on: i64,
}

/// Earliest future instant any of five timer kinds requires a scheduler
/// wakeup: task sleep-until, throttle-wait-until, pending-task timeout,
/// step sleep-until, step timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NextFuture {
    pub ms: Option<u64>,
}

/// The result of `start_next_task`: the picked task, its steps after
/// stalled-timer promotion, and whether more candidates remain.
#[derive(Clone, Debug)]
pub struct PickedTask {
    pub task: Task,
    pub steps: Vec<Step>,
    pub has_more: bool,
}

/// Cursor-paginated read used by the admin read interface (§6):
/// `updated_at > cursor`, ordered ascending, newest last.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListCursor {
    pub after_updated_at: Option<f64>,
    pub limit: i64,
}

/// The narrow interface the rest of the core calls (§4.1). The default
/// backend is [`SqliteStorage`]; any backend satisfying this trait is
/// acceptable.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_task(&self, queue: &str, job: &str, key: &str) -> Result<Option<Task>, StorageError>;

    async fn add_task(
        &self,
        task: NewTask,
        options: AddTaskOptions,
    ) -> Result<AddTaskOutcome, StorageError>;

    async fn start_next_task(&self, queue: &str) -> Result<Option<PickedTask>, StorageError>;

    async fn next_future_task(&self, queue: &str) -> Result<NextFuture, StorageError>;

    async fn resolve_task(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        data: Option<Value>,
    ) -> Result<Task, StorageError>;

    async fn requeue_task(&self, task_id: TaskId) -> Result<Task, StorageError>;

    async fn record_step(
        &self,
        task_id: TaskId,
        step: &str,
        fields: StepFields,
    ) -> Result<Step, StorageError>;

    async fn record_event(
        &self,
        queue: &str,
        key: &str,
        input: Value,
        data: Value,
    ) -> Result<Event, StorageError>;

    async fn list_tasks(&self, queue: &str, job: Option<&str>, cursor: ListCursor) -> Result<Vec<Task>, StorageError>;

    async fn list_steps(&self, task_id: TaskId) -> Result<Vec<Step>, StorageError>;

    async fn list_events(&self, queue: &str, cursor: ListCursor) -> Result<Vec<Event>, StorageError>;

    /// Reset any row left `running` at startup back to `pending`, noting
    /// the recovery in the event log (§9 open question, resolved
    /// conservatively — see DESIGN.md).
    async fn recover_stale_running(&self, queue: &str) -> Result<u64, StorageError>;
}
