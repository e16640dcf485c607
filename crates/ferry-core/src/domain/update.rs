//! Sparse updates applied to a task record, and the preconditions guarding them.

use super::status::ACTIVE;
use super::{TaskError, TaskStatus};

/// A sparse set of field updates. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub attempt_count: Option<u32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn running() -> Self {
        Self::status(TaskStatus::Running)
    }

    pub fn succeeded(result: impl Into<String>) -> Self {
        Self::status(TaskStatus::Success).with_result(result)
    }

    pub fn failed(result: impl Into<String>) -> Self {
        Self::status(TaskStatus::Failed).with_result(result)
    }

    /// Back to `pending` for the next attempt.
    pub fn retry(next_attempt: u32) -> Self {
        Self::status(TaskStatus::Pending).with_attempt_count(next_attempt)
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.result.is_none() && self.attempt_count.is_none()
    }

    /// Reject updates that could never be valid, whatever the stored state.
    pub fn validate(&self, max_attempts: u32) -> Result<(), TaskError> {
        if self.is_empty() {
            return Err(TaskError::Validation("update carries no fields".into()));
        }
        let terminal = self.status.is_some_and(TaskStatus::is_terminal);
        match &self.result {
            Some(_) if !terminal => {
                return Err(TaskError::Validation(
                    "result can only be set together with a terminal status".into(),
                ));
            }
            Some(result) if result.is_empty() => {
                return Err(TaskError::Validation("terminal result must not be empty".into()));
            }
            None if terminal => {
                return Err(TaskError::Validation("terminal status requires a result".into()));
            }
            _ => {}
        }
        if let Some(attempt_count) = self.attempt_count
            && attempt_count > max_attempts
        {
            return Err(TaskError::Validation(format!(
                "attempt_count {attempt_count} exceeds max attempts {max_attempts}"
            )));
        }
        Ok(())
    }

    /// Precondition derived from the target status alone.
    pub fn precondition(&self) -> Precondition {
        Precondition {
            statuses: self.status.map_or(ACTIVE, TaskStatus::allowed_sources),
            attempt_count: None,
        }
    }
}

/// What the stored record must look like for an update to apply.
///
/// Stores evaluate this atomically with the write (a conditional update), so
/// two racing writers cannot both move a task out of the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    pub statuses: &'static [TaskStatus],

    /// When set, the stored `attempt_count` must equal this value.
    pub attempt_count: Option<u32>,
}

impl Precondition {
    pub fn with_attempt(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn holds(&self, status: TaskStatus, attempt_count: u32) -> bool {
        self.statuses.contains(&status)
            && self.attempt_count.is_none_or(|expected| expected == attempt_count)
    }
}
