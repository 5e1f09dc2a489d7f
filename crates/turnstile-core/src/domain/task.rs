//! Task record: the bookkeeping for one asynchronous request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Free-form task status.
///
/// Handlers may publish any intermediate status (`running`, `running model`,
/// ...). The lifecycle only cares about two prefixes: a status starting with
/// `completed` or `failed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStatus(String);

impl TaskStatus {
    pub const CREATED: &'static str = "created";
    pub const RUNNING: &'static str = "running";
    pub const COMPLETED: &'static str = "completed";
    pub const FAILED: &'static str = "failed";
    pub const NOT_FOUND: &'static str = "Not found.";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn created() -> Self {
        Self::new(Self::CREATED)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    /// `failed - <cause>`
    pub fn failed(cause: impl fmt::Display) -> Self {
        Self(format!("{} - {cause}", Self::FAILED))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_terminal(&self) -> bool {
        let lower = self.0.to_ascii_lowercase();
        lower.starts_with(Self::COMPLETED) || lower.starts_with(Self::FAILED)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One task as persisted by a [`crate::ports::TaskStore`].
///
/// Field names on the wire match what existing polling clients expect
/// (`TaskId`, `Status`, `Timestamp`, `Endpoint`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Time of the last update.
    pub timestamp: DateTime<Utc>,
    /// Route path the task was accepted on.
    pub endpoint: String,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, endpoint: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::created(),
            timestamp: now,
            endpoint: endpoint.into(),
        }
    }

    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.timestamp = now;
    }
}

/// Result of a task lookup.
///
/// `NotFound` still carries a placeholder record so that pollers always get
/// the same JSON shape back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLookup {
    Found(TaskRecord),
    NotFound(TaskRecord),
}

impl TaskLookup {
    pub fn not_found(task_id: TaskId, now: DateTime<Utc>) -> Self {
        TaskLookup::NotFound(TaskRecord {
            task_id,
            status: TaskStatus::new(TaskStatus::NOT_FOUND),
            timestamp: now,
            endpoint: String::new(),
        })
    }

    pub fn is_found(&self) -> bool {
        matches!(self, TaskLookup::Found(_))
    }

    pub fn record(&self) -> &TaskRecord {
        match self {
            TaskLookup::Found(r) | TaskLookup::NotFound(r) => r,
        }
    }

    pub fn into_record(self) -> TaskRecord {
        match self {
            TaskLookup::Found(r) | TaskLookup::NotFound(r) => r,
        }
    }

    /// The found record, or `None` for a placeholder.
    pub fn found(self) -> Option<TaskRecord> {
        match self {
            TaskLookup::Found(r) => Some(r),
            TaskLookup::NotFound(_) => None,
        }
    }
}
