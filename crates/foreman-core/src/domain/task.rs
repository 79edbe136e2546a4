//! Task, lease, completion and error records.
//!
//! A `Task` never changes after it is enqueued. Everything that happens to it
//! afterwards is an appended companion row: `Lease`, `Completion`, `ErrorEntry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{LeaseId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A persisted unit of work. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

/// Input for enqueue. The store assigns id and `enqueued_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            scheduled_at,
        }
    }
}

/// A time-bounded claim on a task. Append-only; older rows are history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub task_id: TaskId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Terminal marker. At most one per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub task_id: TaskId,
    pub completed_at: DateTime<Utc>,
}

/// Observability record; does not affect scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub task_id: TaskId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// What `dequeue()` hands to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub task: Task,
    pub lease: Lease,
}

impl LeasedTask {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task.task_type
    }
}
