//! IdempotencyGuard - 配送単位の短命な排他 claim
//!
//! at-least-once 配送で同じ配送が複数ワーカーに届いても、claim window 内に
//! handler を実行するのは 1 回だけにする。durable な status の代わりではない。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::domain::{TaskId, TaskRecord};
use crate::ports::Cache;

/// Identifies one delivery of a task: the task id plus the attempt it was
/// published for. A retry publishes under a new attempt and gets a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub task_id: TaskId,
    pub attempt: u32,
}

impl ClaimKey {
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        Self { task_id, attempt }
    }

    pub fn for_record(record: &TaskRecord) -> Self {
        Self::new(record.id, record.attempt_count)
    }

    fn cache_key(&self) -> String {
        format!("claim:{}:{}", self.task_id, self.attempt)
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task_id, self.attempt)
    }
}

pub struct IdempotencyGuard {
    cache: Arc<dyn Cache>,
    ttl: Duration,
    /// claim の値。どのプロセスが取ったかをデバッグ用に残す
    holder: String,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            holder: Ulid::new().to_string(),
        }
    }

    /// `true` if this call established the claim.
    ///
    /// Backend errors count as a refusal: the delivery is skipped and the
    /// reaper picks the record up later.
    pub async fn claim(&self, key: ClaimKey) -> bool {
        match self
            .cache
            .set_if_absent(&key.cache_key(), &self.holder, self.ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(claim = %key, "claim already held");
                false
            }
            Err(e) => {
                warn!(claim = %key, error = %e, "claim backend failed, skipping delivery");
                false
            }
        }
    }

    /// Give a claim back so a requeued delivery can be processed at once.
    pub async fn release(&self, key: ClaimKey) {
        if let Err(e) = self.cache.delete(&key.cache_key()).await {
            warn!(claim = %key, error = %e, "claim release failed; it will expire");
        }
    }
}
