//! The default SQLite backend for [`crate::Storage`].
//!
//! Every public method is a single transaction (§4.1). `start_next_task`
//! additionally runs the event matcher (§4.5) as its first sub-step,
//! inside the same transaction, so a matched event and the task pick it
//! unblocks are committed atomically.

use async_trait::async_trait;
use chrono::Utc;
use durable_types::{matches_filter, StepStatus, TaskStatus};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::{map_sqlx_error, StorageError};
use crate::model::{step_status_str, task_status_str, Event, Step, Task, TaskId};
use crate::schema::{SCHEMA, STARTUP_PRAGMAS};
use crate::{
    AddTaskOptions, AddTaskOutcome, ListCursor, NewTask, NextFuture, PickedTask, StepFields,
    Storage,
};

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Configuration for [`SqliteStorage::connect`].
#[derive(Clone, Debug)]
pub struct SqliteStorageConfig {
    pub busy_timeout_ms: u32,
    /// Minimum interval between `wait_from` bumps for a single unmatched
    /// waiting step (§4.5 — "throttled to at most once every 50 ms").
    pub wait_from_throttle_ms: f64,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wait_from_throttle_ms: 50.0,
        }
    }
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    config: SqliteStorageConfig,
}

impl SqliteStorage {
    /// Open (creating if needed) a SQLite database at `path` (or
    /// `sqlite::memory:` for an ephemeral store) and apply the schema.
    pub async fn connect(url: &str, config: SqliteStorageConfig) -> Result<Self, StorageError> {
        let options: SqliteConnectOptions = url.parse().map_err(StorageError::Backend)?;
        let options = options
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms as u64));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Backend)?;

        for pragma in STARTUP_PRAGMAS {
            sqlx::query(pragma).execute(&pool).await.map_err(StorageError::Backend)?;
        }
        sqlx::query(SCHEMA).execute(&pool).await.map_err(StorageError::Backend)?;

        Ok(Self { pool, config })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:", SqliteStorageConfig::default()).await
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StorageError> {
        self.pool.begin().await.map_err(StorageError::Backend)
    }

    /// §4.5: scan every `waiting` step in `queue`, match against the
    /// event log, and transition matched steps to `completed`.
    async fn run_event_matcher(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        queue: &str,
        now: f64,
    ) -> Result<(), StorageError> {
        let waiting: Vec<Step> = sqlx::query_as(
            r#"
            SELECT s.* FROM steps s
            JOIN tasks t ON t.id = s.task_id
            WHERE t.queue = ? AND s.status = 'waiting'
            "#,
        )
        .bind(queue)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        for step in waiting {
            let Some(wait_for) = step.wait_for.clone() else { continue };
            let filter: Value = step
                .wait_filter
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StorageError::Corrupt(e.to_string()))?
                .unwrap_or_else(|| Value::Object(Default::default()));
            let wait_from = step.wait_from.unwrap_or(0.0);

            let candidates: Vec<Event> = sqlx::query_as(
                r#"
                SELECT * FROM events
                WHERE queue = ? AND key = ? AND created_at >= ?
                ORDER BY created_at ASC
                "#,
            )
            .bind(queue)
            .bind(&wait_for)
            .bind(wait_from)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

            let matched = candidates.into_iter().find(|event| {
                serde_json::from_str::<Value>(&event.input)
                    .map(|input| matches_filter(&filter, &input))
                    .unwrap_or(false)
            });

            if let Some(event) = matched {
                sqlx::query(
                    "UPDATE steps SET status = 'completed', data = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&event.data)
                .bind(now)
                .bind(step.id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
            } else if now - wait_from >= self.config.wait_from_throttle_ms / 1000.0 {
                sqlx::query("UPDATE steps SET wait_from = ? WHERE id = ?")
                    .bind(now)
                    .bind(step.id)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx_error)?;
            }
        }
        Ok(())
    }

    /// Promote a task's steps that are `stalled` with an elapsed
    /// `sleep_until` into their `next_status` — §4.1 step (5).
    async fn promote_stalled_steps(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        task_id: TaskId,
        now: f64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE steps
            SET status = COALESCE(next_status, status), next_status = NULL, updated_at = ?
            WHERE task_id = ? AND status = 'stalled' AND sleep_until IS NOT NULL AND sleep_until <= ?
            "#,
        )
        .bind(now)
        .bind(task_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// A task or step is blocking when it has a step that is `waiting`, or
/// `stalled` with an unexpired `sleep_until` (§3 invariants).
const BLOCKING_STEP_PREDICATE: &str = r#"
    EXISTS (
        SELECT 1 FROM steps s
        WHERE s.task_id = tasks.id
          AND (
            s.status = 'waiting'
            OR (s.status = 'stalled' AND (s.sleep_until IS NULL OR s.sleep_until > ?))
          )
    )
"#;

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_task(&self, queue: &str, job: &str, key: &str) -> Result<Option<Task>, StorageError> {
        sqlx::query_as("SELECT * FROM tasks WHERE queue = ? AND job = ? AND key = ?")
            .bind(queue)
            .bind(job)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn add_task(
        &self,
        task: NewTask,
        options: AddTaskOptions,
    ) -> Result<AddTaskOutcome, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        // The exact-key dedup check runs before rate limiting: redispatch
        // of a task the caller has already seen is unconditionally
        // idempotent (§4.1 `add_task`) and must never be shadowed by a
        // *different* task merely sharing the same `rate_limit_id` group.
        if let Some(existing) = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE queue = ? AND job = ? AND key = ?",
        )
        .bind(&task.queue)
        .bind(&task.job)
        .bind(&task.key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        {
            tx.commit().await.map_err(StorageError::Backend)?;
            return Ok(AddTaskOutcome {
                task: existing,
                inserted: false,
                rate_limit_retry_ms: None,
                cancelled_sibling: None,
            });
        }

        if let Some(rate_limit) = &options.rate_limit {
            let blocking: Option<Task> = sqlx::query_as(
                r#"
                SELECT * FROM tasks
                WHERE rate_limit_id = ? AND created_at >= ?
                ORDER BY created_at ASC LIMIT 1
                "#,
            )
            .bind(&rate_limit.id)
            .bind(now - rate_limit.window_seconds as f64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if let Some(blocking) = blocking {
                let retry_ms = ((blocking.created_at + rate_limit.window_seconds as f64 - now)
                    * 1000.0)
                    .max(0.0) as u64;
                tx.commit().await.map_err(StorageError::Backend)?;
                return Ok(AddTaskOutcome {
                    task: blocking,
                    inserted: false,
                    rate_limit_retry_ms: Some(retry_ms),
                    cancelled_sibling: None,
                });
            }
        }

        let mut cancelled_sibling = None;
        if let Some(debounce) = &options.debounce {
            if let Some(previous) = sqlx::query_as::<_, Task>(
                r#"
                SELECT * FROM tasks
                WHERE debounce_id = ? AND started_at IS NULL
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(&debounce.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            {
                sqlx::query(
                    "UPDATE tasks SET status = 'cancelled', data = ?, updated_at = ? WHERE id = ?",
                )
                .bind(r#"{"type":"debounce"}"#)
                .bind(now)
                .bind(previous.id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

                let mut cancelled = previous;
                cancelled.status = crate::model::TaskStatusColumn(TaskStatus::Cancelled);
                cancelled.data = Some(r#"{"type":"debounce"}"#.to_string());
                cancelled.updated_at = now;
                cancelled_sibling = Some(cancelled);
            }
        }

        let sleep_until = options.debounce.as_ref().map(|d| now + d.delay_ms as f64 / 1000.0);
        let status = if options.debounce.is_some() || options.throttle.is_some() {
            TaskStatus::Stalled
        } else {
            TaskStatus::Pending
        };

        let input_json = serde_json::to_string(&task.input)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let row: Task = sqlx::query_as(
            r#"
            INSERT INTO tasks (
                parent_id, queue, job, key, input, priority, status, loop_count,
                timeout_at, sleep_until, started_at, created_at, updated_at, data,
                debounce_id, throttle_id, throttle_duration, rate_limit_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, NULL, ?, ?, NULL, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(task.parent_id)
        .bind(&task.queue)
        .bind(&task.job)
        .bind(&task.key)
        .bind(&input_json)
        .bind(task.priority)
        .bind(task_status_str(status))
        .bind(task.timeout_at)
        .bind(sleep_until)
        .bind(now)
        .bind(now)
        .bind(options.debounce.as_ref().map(|d| d.id.clone()))
        .bind(options.throttle.as_ref().map(|t| t.id.clone()))
        .bind(options.throttle.as_ref().map(|t| t.duration_ms as f64 / 1000.0))
        .bind(options.rate_limit.as_ref().map(|r| r.id.clone()))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(AddTaskOutcome {
            task: row,
            inserted: true,
            rate_limit_retry_ms: None,
            cancelled_sibling,
        })
    }

    async fn start_next_task(&self, queue: &str) -> Result<Option<PickedTask>, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        self.run_event_matcher(&mut tx, queue, now).await?;

        let query = format!(
            r#"
            SELECT * FROM tasks
            WHERE queue = ? AND (
                (timeout_at IS NOT NULL AND timeout_at <= ? AND status IN ('pending', 'stalled'))
                OR EXISTS (
                    SELECT 1 FROM steps s WHERE s.task_id = tasks.id
                    AND s.timeout_at IS NOT NULL AND s.timeout_at <= ?
                    AND s.status NOT IN ('completed', 'failed')
                )
                OR (status = 'pending' AND NOT {blocking})
                OR (
                    status = 'stalled' AND sleep_until IS NOT NULL AND sleep_until <= ? AND NOT {blocking}
                    AND (
                        throttle_id IS NULL
                        OR NOT EXISTS (
                            SELECT 1 FROM tasks t2
                            WHERE t2.throttle_id = tasks.throttle_id
                              AND t2.started_at IS NOT NULL
                              AND t2.started_at + COALESCE(tasks.throttle_duration, 0) > ?
                        )
                    )
                )
                OR (
                    status = 'stalled' AND throttle_id IS NOT NULL
                    AND NOT EXISTS (
                        SELECT 1 FROM tasks t2
                        WHERE t2.throttle_id = tasks.throttle_id
                          AND t2.started_at IS NOT NULL
                          AND t2.started_at + COALESCE(tasks.throttle_duration, 0) > ?
                    )
                )
            )
            ORDER BY priority DESC, created_at ASC
            LIMIT 2
            "#,
            blocking = BLOCKING_STEP_PREDICATE
        );

        let candidates: Vec<Task> = sqlx::query_as(&query)
            .bind(queue)
            .bind(now)
            .bind(now)
            .bind(now) // blocking-step predicate for the `pending` arm
            .bind(now)
            .bind(now) // blocking-step predicate for the `stalled`+sleep arm
            .bind(now) // throttle clearance for the `stalled`+sleep arm
            .bind(now) // throttle clearance for the dedicated throttle arm
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let Some(picked) = candidates.first().cloned() else {
            tx.commit().await.map_err(StorageError::Backend)?;
            return Ok(None);
        };
        let has_more = candidates.len() > 1;

        let started_at = picked.started_at.unwrap_or(now);
        let task: Task = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'running', started_at = ?, loop_count = loop_count + 1, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(started_at)
        .bind(now)
        .bind(picked.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        self.promote_stalled_steps(&mut tx, task.id, now).await?;

        let steps: Vec<Step> = sqlx::query_as("SELECT * FROM steps WHERE task_id = ? ORDER BY id ASC")
            .bind(task.id)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(Some(PickedTask { task, steps, has_more }))
    }

    async fn next_future_task(&self, queue: &str) -> Result<NextFuture, StorageError> {
        let now = now_secs();

        let candidates: [Option<f64>; 5] = [
            sqlx::query_scalar(
                "SELECT MIN(sleep_until) FROM tasks WHERE queue = ? AND status = 'stalled' AND sleep_until IS NOT NULL AND sleep_until > ?",
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?,
            sqlx::query_scalar(
                r#"
                SELECT MIN(t2.started_at + COALESCE(t1.throttle_duration, 0)) FROM tasks t1
                JOIN tasks t2 ON t2.throttle_id = t1.throttle_id AND t2.started_at IS NOT NULL
                WHERE t1.queue = ? AND t1.status = 'stalled' AND t1.throttle_id IS NOT NULL
                  AND t2.started_at + COALESCE(t1.throttle_duration, 0) > ?
                "#,
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?,
            sqlx::query_scalar(
                "SELECT MIN(timeout_at) FROM tasks WHERE queue = ? AND status IN ('pending', 'stalled') AND timeout_at IS NOT NULL AND timeout_at > ?",
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?,
            sqlx::query_scalar(
                r#"
                SELECT MIN(s.sleep_until) FROM steps s JOIN tasks t ON t.id = s.task_id
                WHERE t.queue = ? AND s.status = 'stalled' AND s.sleep_until IS NOT NULL AND s.sleep_until > ?
                "#,
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?,
            sqlx::query_scalar(
                r#"
                SELECT MIN(s.timeout_at) FROM steps s JOIN tasks t ON t.id = s.task_id
                WHERE t.queue = ? AND s.timeout_at IS NOT NULL AND s.timeout_at > ?
                  AND s.status NOT IN ('completed', 'failed')
                "#,
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?,
        ];

        let min = candidates.into_iter().flatten().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a: f64| a.min(v)))
        });

        Ok(NextFuture {
            ms: min.map(|at| ((at - now) * 1000.0).max(0.0) as u64),
        })
    }

    async fn resolve_task(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        data: Option<Value>,
    ) -> Result<Task, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        let current: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;

        durable_types::invariants::check_task_transition(current.status(), status)?;

        let data_json = data
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let updated: Task = sqlx::query_as(
            "UPDATE tasks SET status = ?, data = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(task_status_str(status))
        .bind(data_json)
        .bind(now)
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(updated)
    }

    async fn requeue_task(&self, task_id: TaskId) -> Result<Task, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        let current: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StorageError::NotFound)?;

        durable_types::invariants::check_task_transition(current.status(), TaskStatus::Pending)?;

        let updated: Task = sqlx::query_as(
            "UPDATE tasks SET status = 'pending', updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(now)
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(updated)
    }

    async fn record_step(
        &self,
        task_id: TaskId,
        step: &str,
        fields: StepFields,
    ) -> Result<Step, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        let existing: Option<Step> =
            sqlx::query_as("SELECT * FROM steps WHERE task_id = ? AND step = ?")
                .bind(task_id)
                .bind(step)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        if let Some(existing) = &existing {
            durable_types::invariants::check_step_transition(existing.status(), fields.status)?;
        }

        let sleep_until = fields.sleep_for.map(|s| now + s);
        let timeout_at = fields.timeout.map(|s| now + s);
        let wait_from = fields
            .wait_for
            .as_ref()
            .map(|_| if fields.wait_retroactive { 0.0 } else { now });
        let runs = match &existing {
            Some(e) if fields.status == StepStatus::Running => e.runs + 1,
            Some(e) => e.runs,
            None if fields.status == StepStatus::Running => 1,
            None => 0,
        };
        let data_json = fields
            .data
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let wait_filter_json = fields
            .wait_filter
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let row: Step = sqlx::query_as(
            r#"
            INSERT INTO steps (
                task_id, step, status, next_status, runs, sleep_until, timeout_at,
                wait_for, wait_filter, wait_from, data, discovered_on, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id, step) DO UPDATE SET
                status = excluded.status,
                next_status = excluded.next_status,
                runs = excluded.runs,
                sleep_until = excluded.sleep_until,
                timeout_at = excluded.timeout_at,
                wait_for = excluded.wait_for,
                wait_filter = excluded.wait_filter,
                wait_from = excluded.wait_from,
                data = excluded.data,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(step)
        .bind(step_status_str(fields.status))
        .bind(fields.next_status.map(step_status_str))
        .bind(runs)
        .bind(sleep_until)
        .bind(timeout_at)
        .bind(&fields.wait_for)
        .bind(&wait_filter_json)
        .bind(wait_from)
        .bind(&data_json)
        .bind(fields.discovered_on)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(row)
    }

    async fn record_event(
        &self,
        queue: &str,
        key: &str,
        input: Value,
        data: Value,
    ) -> Result<Event, StorageError> {
        let mut now = now_secs();
        let mut tx = self.begin().await?;

        let previous: Option<f64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM events WHERE queue = ?")
                .bind(queue)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        if durable_types::invariants::check_event_order(queue, previous, now).is_err() {
            // Clock went backwards relative to the last append; clamp
            // forward rather than rejecting the event outright — only
            // determinism of ordering is required (§4.2), not wall-clock
            // fidelity.
            now = previous.unwrap_or(now);
        }

        let input_json = serde_json::to_string(&input).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let data_json = serde_json::to_string(&data).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let row: Event = sqlx::query_as(
            "INSERT INTO events (queue, key, created_at, input, data) VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(queue)
        .bind(key)
        .bind(now)
        .bind(&input_json)
        .bind(&data_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(row)
    }

    async fn list_tasks(
        &self,
        queue: &str,
        job: Option<&str>,
        cursor: ListCursor,
    ) -> Result<Vec<Task>, StorageError> {
        let limit = if cursor.limit > 0 { cursor.limit } else { 100 };
        let rows: Vec<Task> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE queue = ? AND (? IS NULL OR job = ?) AND updated_at > ?
            ORDER BY updated_at ASC
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(job)
        .bind(job)
        .bind(cursor.after_updated_at.unwrap_or(0.0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows)
    }

    async fn list_steps(&self, task_id: TaskId) -> Result<Vec<Step>, StorageError> {
        sqlx::query_as("SELECT * FROM steps WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn list_events(&self, queue: &str, cursor: ListCursor) -> Result<Vec<Event>, StorageError> {
        let limit = if cursor.limit > 0 { cursor.limit } else { 100 };
        sqlx::query_as(
            r#"
            SELECT * FROM events WHERE queue = ? AND created_at > ?
            ORDER BY created_at ASC LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(cursor.after_updated_at.unwrap_or(0.0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn recover_stale_running(&self, queue: &str) -> Result<u64, StorageError> {
        let now = now_secs();
        let mut tx = self.begin().await?;

        let stale: Vec<TaskId> = sqlx::query("SELECT id FROM tasks WHERE queue = ? AND status = 'running'")
            .bind(queue)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(|row| row.get::<TaskId, _>("id"))
            .collect();

        if stale.is_empty() {
            tx.commit().await.map_err(StorageError::Backend)?;
            return Ok(0);
        }

        for task_id in &stale {
            sqlx::query("UPDATE tasks SET status = 'pending', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            let data = serde_json::json!({ "task_id": task_id, "queue": queue });
            sqlx::query(
                "INSERT INTO events (queue, key, created_at, input, data) VALUES (?, 'system/recovered', ?, '{}', ?)",
            )
            .bind(queue)
            .bind(now)
            .bind(data.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(StorageError::Backend)?;
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn storage() -> SqliteStorage {
        SqliteStorage::in_memory().await.unwrap()
    }

    fn new_task(job: &str, key: &str, input: Value) -> NewTask {
        NewTask {
            parent_id: None,
            queue: "q".into(),
            job: job.into(),
            key: key.into(),
            input,
            priority: 0,
            timeout_at: None,
        }
    }

    #[tokio::test]
    async fn add_task_dedupes_on_queue_job_key() {
        let storage = storage().await;
        let a = storage
            .add_task(new_task("job", "k1", json!({"a": 1})), AddTaskOptions::default())
            .await
            .unwrap();
        assert!(a.inserted);

        let b = storage
            .add_task(new_task("job", "k1", json!({"a": 1})), AddTaskOptions::default())
            .await
            .unwrap();
        assert!(!b.inserted);
        assert_eq!(a.task.id, b.task.id);
    }

    #[tokio::test]
    async fn start_next_task_picks_highest_priority_first() {
        let storage = storage().await;
        for (key, priority) in [("a", 2), ("b", 10), ("c", 0)] {
            let mut task = new_task("job", key, json!({ "key": key }));
            task.priority = priority;
            storage.add_task(task, AddTaskOptions::default()).await.unwrap();
        }

        let picked = storage.start_next_task("q").await.unwrap().unwrap();
        assert_eq!(picked.task.key, "b");
    }

    #[tokio::test]
    async fn start_next_task_returns_none_when_nothing_runnable() {
        let storage = storage().await;
        assert!(storage.start_next_task("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiting_step_completes_on_matching_event() {
        let storage = storage().await;
        let outcome = storage
            .add_task(new_task("job", "k1", json!({})), AddTaskOptions::default())
            .await
            .unwrap();
        let picked = storage.start_next_task("q").await.unwrap().unwrap();
        assert_eq!(picked.task.id, outcome.task.id);

        storage
            .record_step(
                picked.task.id,
                "system/wait_for#0",
                StepFields {
                    status: StepStatus::Waiting,
                    wait_for: Some("pipe/p".into()),
                    wait_filter: Some(json!({"num": 42})),
                    wait_retroactive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        storage.requeue_task(picked.task.id).await.unwrap();

        storage
            .record_event("q", "pipe/p", json!({"num": 1}), json!({}))
            .await
            .unwrap();
        storage
            .record_event("q", "pipe/p", json!({"num": 42}), json!({"res": 42}))
            .await
            .unwrap();

        let picked2 = storage.start_next_task("q").await.unwrap().unwrap();
        let step = picked2.steps.iter().find(|s| s.step == "system/wait_for#0").unwrap();
        assert_eq!(step.status(), StepStatus::Completed);
        assert_eq!(step.data.as_deref(), Some(r#"{"res":42}"#));
    }

    #[tokio::test]
    async fn resolve_task_rejects_leaving_terminal_state() {
        let storage = storage().await;
        let outcome = storage
            .add_task(new_task("job", "k1", json!({})), AddTaskOptions::default())
            .await
            .unwrap();
        storage
            .resolve_task(outcome.task.id, TaskStatus::Completed, None)
            .await
            .unwrap();

        let err = storage
            .resolve_task(outcome.task.id, TaskStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)));
    }

    #[tokio::test]
    async fn debounce_cancels_prior_unstarted_sibling() {
        let storage = storage().await;
        let options = AddTaskOptions {
            debounce: Some(crate::DebounceOptions { id: "g".into(), delay_ms: 50 }),
            ..Default::default()
        };
        let first = storage
            .add_task(new_task("job", "k1", json!({"a": 1})), options.clone())
            .await
            .unwrap();
        assert!(first.inserted);
        assert!(first.cancelled_sibling.is_none());

        let second = storage
            .add_task(new_task("job", "k2", json!({"a": 2})), options)
            .await
            .unwrap();
        assert!(second.inserted);
        let cancelled = second.cancelled_sibling.unwrap();
        assert_eq!(cancelled.id, first.task.id);
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn rate_limit_blocks_without_inserting() {
        let storage = storage().await;
        let options = AddTaskOptions {
            rate_limit: Some(crate::RateLimitOptions { id: "g".into(), window_seconds: 60 }),
            ..Default::default()
        };
        let first = storage
            .add_task(new_task("job", "k1", json!({"a": 1})), options.clone())
            .await
            .unwrap();
        assert!(first.inserted);

        let second = storage
            .add_task(new_task("job", "k2", json!({"a": 2})), options)
            .await
            .unwrap();
        assert!(!second.inserted);
        assert!(second.rate_limit_retry_ms.is_some());
    }

    #[tokio::test]
    async fn recover_stale_running_resets_to_pending_and_notes_event() {
        let storage = storage().await;
        let outcome = storage
            .add_task(new_task("job", "k1", json!({})), AddTaskOptions::default())
            .await
            .unwrap();
        storage.start_next_task("q").await.unwrap();

        let recovered = storage.recover_stale_running("q").await.unwrap();
        assert_eq!(recovered, 1);

        let task = storage.get_task("q", "job", &outcome.task.key).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);

        let events = storage.list_events("q", ListCursor::default()).await.unwrap();
        assert!(events.iter().any(|e| e.key == "system/recovered"));
    }
}
