//! TaskService - HTTP 境界の 1:1 の写像
//!
//! - `POST /tasks {kind, payload}` → [`TaskService::submit`]
//! - `GET /tasks/{id}` → [`TaskService::get_by_str`]
//!
//! status code は `TaskError::class().http_status()` で決まる。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::dispatcher::Dispatcher;
use crate::domain::{TaskError, TaskId, TaskRecord, TaskStatus};
use crate::lifecycle::CacheAside;

/// Request body of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTask {
    pub kind: String,
    pub payload: String,
}

pub struct TaskService {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<CacheAside>,
}

impl TaskService {
    pub fn new(dispatcher: Arc<Dispatcher>, cache: Arc<CacheAside>) -> Self {
        Self { dispatcher, cache }
    }

    pub async fn submit(&self, request: SubmitTask) -> Result<TaskRecord, TaskError> {
        self.dispatcher.submit(&request.kind, &request.payload).await
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, TaskError> {
        self.cache.read(id).await?.ok_or(TaskError::NotFound(id))
    }

    /// Path-parameter variant of [`get`](Self::get). A malformed id is a
    /// validation error, not a miss.
    pub async fn get_by_str(&self, id: &str) -> Result<TaskRecord, TaskError> {
        let id = id
            .parse::<TaskId>()
            .map_err(|e| TaskError::Validation(e.to_string()))?;
        self.get(id).await
    }

    /// Status only. Served from the status entry when cached.
    pub async fn status(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        self.cache
            .cached_status(id)
            .await?
            .ok_or(TaskError::NotFound(id))
    }
}
