//! Errors and their classification.

use thiserror::Error;

use super::{TaskId, TaskStatus};
use crate::ports::{BrokerError, StoreError};

/// Operational classification of a failure.
///
/// - Validation: malformed input, never retried
/// - NotFound: unknown task id
/// - Transient: store/cache/broker unreachable
/// - Handler: task-specific processing failure, drives the retry policy
/// - Exhausted: retries used up, recorded as `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Transient,
    Handler,
    Exhausted,
}

impl ErrorClass {
    /// Status code used at the HTTP boundary.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::NotFound => 404,
            ErrorClass::Transient => 503,
            ErrorClass::Handler | ErrorClass::Exhausted => 500,
        }
    }
}

/// Errors surfaced by the core operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("store failure: {0}")]
    Store(#[source] StoreError),

    #[error("task {id} was stored but could not be published: {source}")]
    Publish {
        id: TaskId,
        #[source]
        source: BrokerError,
    },

    #[error("task encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TaskError::NotFound(id),
            other => TaskError::Store(other),
        }
    }
}

impl TaskError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::Validation(_) | TaskError::InvalidTransition { .. } => {
                ErrorClass::Validation
            }
            TaskError::NotFound(_) => ErrorClass::NotFound,
            TaskError::Store(_) | TaskError::Publish { .. } | TaskError::Codec(_) => {
                ErrorClass::Transient
            }
        }
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// May succeed on a later attempt.
    #[error("{0}")]
    Transient(String),

    /// Can never succeed; the task fails without retrying.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn store_not_found_becomes_task_not_found() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = TaskError::from(StoreError::NotFound(id));
        assert!(matches!(err, TaskError::NotFound(got) if got == id));
        assert_eq!(err.class().http_status(), 404);
    }

    #[test]
    fn infra_failures_are_transient() {
        let err = TaskError::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.class().http_status(), 503);
    }

    #[test]
    fn broker_failures_surface_only_as_publish_errors() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = TaskError::Publish {
            id,
            source: BrokerError::Unavailable("channel closed".into()),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = TaskError::Validation("kind is required".into());
        assert_eq!(err.class().http_status(), 400);
    }
}
