//! Task record: the durable representation of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TaskId, TaskStatus, TaskUpdate};

/// Tag selecting the handler for a task (e.g. `email`, `data_sync`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A task and its lifecycle state.
///
/// The same shape is stored, cached and published on the queue. `id`, `kind`,
/// `payload` and `created_at` never change after creation; everything else is
/// written only through [`TaskRecord::apply`], driven by the lifecycle
/// controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: String,
    pub status: TaskStatus,

    /// Empty until the task is terminal.
    #[serde(default)]
    pub result: String,

    /// Number of re-dispatches so far.
    #[serde(default)]
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, kind: TaskKind, payload: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
            status: TaskStatus::Pending,
            result: String::new(),
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy the supplied fields of `update` onto the record and stamp `updated_at`.
    ///
    /// Does not check preconditions; stores do that before calling this.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(result) = &update.result {
            self.result = result.clone();
        }
        if let Some(attempt_count) = update.attempt_count {
            self.attempt_count = attempt_count;
        }
        self.updated_at = now;
    }
}
