//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Running -> Success
/// - Pending -> Running -> Failed
/// - Pending -> Running -> Pending -> Running ... (retry loop, bounded by max attempts)
/// - Running -> Running (redelivery of an attempt whose worker died)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and waiting for a worker.
    Pending,

    /// Claimed by a worker, handler executing.
    Running,

    /// Handler succeeded.
    Success,

    /// Failed permanently or retries exhausted.
    Failed,
}

/// Statuses from which a record may still change.
pub const ACTIVE: &[TaskStatus] = &[TaskStatus::Pending, TaskStatus::Running];

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Statuses a record must currently be in for a move into `self` to apply.
    pub fn allowed_sources(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Running],
            TaskStatus::Running => ACTIVE,
            TaskStatus::Success | TaskStatus::Failed => &[TaskStatus::Running],
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.allowed_sources().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
