//! TaskStore port - the durable store, source of truth for task records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Precondition, TaskId, TaskRecord, TaskUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    Duplicate(TaskId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored task is corrupt: {0}")]
    Corrupt(String),
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Precondition held; carries the record as written.
    Applied(TaskRecord),

    /// Precondition failed; nothing was written. Carries the current record.
    Rejected(TaskRecord),
}

/// TaskStore は状態の正本（source of truth）
///
/// # 設計原則
/// - 全操作は id をキーにしたトランザクション
/// - 状態遷移は条件付き更新（precondition と write が同一トランザクション）
/// - NotFound と接続障害は区別できること
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` if the id exists.
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// Apply `update` and stamp `updated_at = now`, only if `precondition`
    /// holds for the stored record.
    async fn update_fields(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        precondition: Precondition,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Non-terminal (pending or running) records last touched before
    /// `older_than`, oldest first.
    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;
}
