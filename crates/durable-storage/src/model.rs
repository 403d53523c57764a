//! Row models for the `tasks`, `steps`, and `events` tables.
//!
//! Timestamps are sub-second floats (unix epoch seconds), matching the
//! wire/JSON representation of §6 directly — no TEXT/RFC3339 round trip
//! at the storage boundary.

use durable_types::{StepStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub type TaskId = i64;
pub type StepId = i64;

#[derive(Clone, Debug, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub queue: String,
    pub job: String,
    pub key: String,
    pub input: String,
    pub priority: i64,
    #[sqlx(try_from = "String")]
    pub status: TaskStatusColumn,
    #[sqlx(rename = "loop_count")]
    pub loop_count: i64,
    pub timeout_at: Option<f64>,
    pub sleep_until: Option<f64>,
    pub started_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
    pub data: Option<String>,
    pub debounce_id: Option<String>,
    pub throttle_id: Option<String>,
    pub throttle_duration: Option<f64>,
    pub rate_limit_id: Option<String>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.status.0
    }
}

#[derive(Clone, Debug, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub task_id: TaskId,
    pub step: String,
    #[sqlx(try_from = "String")]
    pub status: StepStatusColumn,
    #[sqlx(try_from = "Option<String>")]
    pub next_status: NextStatusColumn,
    pub runs: i64,
    pub sleep_until: Option<f64>,
    pub timeout_at: Option<f64>,
    pub wait_for: Option<String>,
    pub wait_filter: Option<String>,
    pub wait_from: Option<f64>,
    pub data: Option<String>,
    pub discovered_on: i64,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Step {
    pub fn status(&self) -> StepStatus {
        self.status.0
    }

    pub fn next_status(&self) -> Option<StepStatus> {
        self.next_status.0
    }
}

#[derive(Clone, Debug, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub queue: String,
    pub key: String,
    pub created_at: f64,
    pub input: String,
    pub data: String,
}

/// Newtype wrapper converting the `TEXT` status column to/from
/// [`TaskStatus`] via `sqlx(try_from)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStatusColumn(pub TaskStatus);

impl TryFrom<String> for TaskStatusColumn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(match value.as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "stalled" => TaskStatus::Stalled,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            other => return Err(format!("unknown task status {other:?}")),
        }))
    }
}

pub fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Stalled => "stalled",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepStatusColumn(pub StepStatus);

impl TryFrom<String> for StepStatusColumn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(match value.as_str() {
            "running" => StepStatus::Running,
            "pending" => StepStatus::Pending,
            "stalled" => StepStatus::Stalled,
            "waiting" => StepStatus::Waiting,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            other => return Err(format!("unknown step status {other:?}")),
        }))
    }
}

pub fn step_status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Running => "running",
        StepStatus::Pending => "pending",
        StepStatus::Stalled => "stalled",
        StepStatus::Waiting => "waiting",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NextStatusColumn(pub Option<StepStatus>);

impl TryFrom<Option<String>> for NextStatusColumn {
    type Error = String;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        Ok(Self(match value {
            Some(raw) => Some(StepStatusColumn::try_from(raw)?.0),
            None => None,
        }))
    }
}
