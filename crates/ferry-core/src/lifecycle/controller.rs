//! LifecycleController - status 遷移の唯一の入口
//!
//! # 設計原則
//! - 遷移は store の条件付き更新 1 回（precondition 付き）
//! - store 書き込み成功後: status があれば status エントリを書き、全レコードエントリは必ず削除
//! - cache の失敗はログのみ。store の失敗は必ず返す
//! - terminal なレコードへの再度の書き込みはエラーではなく Ignored

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{TaskError, TaskId, TaskRecord, TaskUpdate};
use crate::lifecycle::CacheAside;
use crate::ports::{Clock, TaskStore, UpdateOutcome};

/// Outcome of a transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The store accepted the update; carries the record as written.
    Applied(TaskRecord),

    /// The record already moved on (terminal, or a newer attempt) and the
    /// update was dropped as a no-op; carries the current record.
    Ignored(TaskRecord),
}

impl Transition {
    pub fn record(&self) -> &TaskRecord {
        match self {
            Transition::Applied(r) | Transition::Ignored(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

pub struct LifecycleController {
    store: Arc<dyn TaskStore>,
    cache: Arc<CacheAside>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cache: Arc<CacheAside>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            max_attempts,
        }
    }

    /// Apply a sparse update to the record `id`.
    pub async fn transition(&self, id: TaskId, update: TaskUpdate) -> Result<Transition, TaskError> {
        self.apply(id, update, None).await
    }

    /// Like [`transition`](Self::transition), but only if the stored
    /// `attempt_count` still equals `expected_attempt`. A mismatch means a
    /// stale delivery and yields [`Transition::Ignored`].
    pub async fn transition_guarded(
        &self,
        id: TaskId,
        update: TaskUpdate,
        expected_attempt: u32,
    ) -> Result<Transition, TaskError> {
        self.apply(id, update, Some(expected_attempt)).await
    }

    pub async fn mark_running(&self, id: TaskId, attempt: u32) -> Result<Transition, TaskError> {
        self.transition_guarded(id, TaskUpdate::running(), attempt).await
    }

    pub async fn complete(
        &self,
        id: TaskId,
        attempt: u32,
        result: impl Into<String>,
    ) -> Result<Transition, TaskError> {
        self.transition_guarded(id, TaskUpdate::succeeded(result), attempt)
            .await
    }

    pub async fn fail(
        &self,
        id: TaskId,
        attempt: u32,
        reason: impl Into<String>,
    ) -> Result<Transition, TaskError> {
        self.transition_guarded(id, TaskUpdate::failed(reason), attempt)
            .await
    }

    /// Back to `pending` with `attempt_count = attempt + 1`.
    pub async fn schedule_retry(&self, id: TaskId, attempt: u32) -> Result<Transition, TaskError> {
        self.transition_guarded(id, TaskUpdate::retry(attempt + 1), attempt)
            .await
    }

    #[tracing::instrument(skip_all, fields(task_id = %id, to = ?update.status, expected_attempt = ?expected_attempt))]
    async fn apply(
        &self,
        id: TaskId,
        update: TaskUpdate,
        expected_attempt: Option<u32>,
    ) -> Result<Transition, TaskError> {
        update.validate(self.max_attempts)?;

        let mut precondition = update.precondition();
        if let Some(attempt) = expected_attempt {
            precondition = precondition.with_attempt(attempt);
        }

        let now = self.clock.now();
        match self
            .store
            .update_fields(id, &update, precondition, now)
            .await?
        {
            UpdateOutcome::Applied(record) => {
                // 並行する遷移と順序が入れ替わると status エントリは古い値で TTL まで残りうる
                if let Some(status) = update.status {
                    self.cache.write_status(id, status).await;
                }
                self.cache.invalidate(id).await;
                if record.is_terminal() {
                    info!(status = %record.status, attempt = record.attempt_count, "task finished");
                } else {
                    debug!(status = %record.status, attempt = record.attempt_count, "transition applied");
                }
                Ok(Transition::Applied(record))
            }
            UpdateOutcome::Rejected(current) => {
                let stale = expected_attempt.is_some_and(|a| a != current.attempt_count);
                if current.is_terminal() || stale {
                    debug!(
                        current = %current.status,
                        attempt = current.attempt_count,
                        "transition ignored"
                    );
                    return Ok(Transition::Ignored(current));
                }
                Err(TaskError::InvalidTransition {
                    id,
                    from: current.status,
                    to: update.status.unwrap_or(current.status),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKind, TaskStatus};
    use crate::impls::{InMemoryCache, InMemoryTaskStore};
    use crate::lifecycle::cache_aside::{record_key, status_key};
    use crate::ports::{Cache, FixedClock, StoreError};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::time::Duration;
    use ulid::Ulid;

    const MAX: u32 = 3;

    struct Fixture {
        cache: Arc<InMemoryCache>,
        store: Arc<InMemoryTaskStore>,
        accessor: Arc<CacheAside>,
        clock: Arc<FixedClock>,
        controller: LifecycleController,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let accessor = Arc::new(CacheAside::new(
            cache.clone(),
            store.clone(),
            Duration::from_secs(60),
        ));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let controller = LifecycleController::new(store.clone(), accessor.clone(), clock.clone(), MAX);
        Fixture {
            cache,
            store,
            accessor,
            clock,
            controller,
        }
    }

    async fn seed(f: &Fixture) -> TaskRecord {
        let r = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("email"),
            "hi",
            f.clock.now(),
        );
        f.store.create(&r).await.unwrap();
        r
    }

    #[tokio::test]
    async fn happy_path_walks_pending_running_success() {
        let f = fixture();
        let r = seed(&f).await;

        f.clock.advance(chrono::Duration::seconds(1));
        let running = f.controller.mark_running(r.id, 0).await.unwrap();
        assert!(running.is_applied());
        assert_eq!(running.record().status, TaskStatus::Running);
        assert!(running.record().updated_at > r.updated_at);

        let done = f.controller.complete(r.id, 0, "sent").await.unwrap();
        assert_eq!(done.record().status, TaskStatus::Success);
        assert_eq!(done.record().result, "sent");
        assert_eq!(done.record().attempt_count, 0);
    }

    #[tokio::test]
    async fn retry_returns_to_pending_with_next_attempt() {
        let f = fixture();
        let r = seed(&f).await;
        f.controller.mark_running(r.id, 0).await.unwrap();

        let retried = f.controller.schedule_retry(r.id, 0).await.unwrap();
        assert_eq!(retried.record().status, TaskStatus::Pending);
        assert_eq!(retried.record().attempt_count, 1);
        assert!(retried.record().result.is_empty());
    }

    #[tokio::test]
    async fn terminal_record_ignores_further_transitions() {
        let f = fixture();
        let r = seed(&f).await;
        f.controller.mark_running(r.id, 0).await.unwrap();
        f.controller.complete(r.id, 0, "first").await.unwrap();

        let again = f.controller.fail(r.id, 0, "second").await.unwrap();
        assert_eq!(again, Transition::Ignored(f.store.get_by_id(r.id).await.unwrap()));
        assert_eq!(again.record().result, "first");

        let rerun = f.controller.mark_running(r.id, 0).await.unwrap();
        assert!(!rerun.is_applied());
        assert_eq!(rerun.record().status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn stale_attempt_is_ignored() {
        let f = fixture();
        let r = seed(&f).await;
        f.controller.mark_running(r.id, 0).await.unwrap();
        f.controller.schedule_retry(r.id, 0).await.unwrap();

        // attempt 0 の配送がもう一度届いても何もしない
        let stale = f.controller.mark_running(r.id, 0).await.unwrap();
        assert!(!stale.is_applied());
        assert_eq!(stale.record().status, TaskStatus::Pending);
        assert_eq!(stale.record().attempt_count, 1);
    }

    #[rstest]
    #[case::success_from_pending(TaskUpdate::succeeded("x"))]
    #[case::failed_from_pending(TaskUpdate::failed("x"))]
    #[case::retry_from_pending(TaskUpdate::retry(1))]
    #[tokio::test]
    async fn skipping_running_is_rejected(#[case] update: TaskUpdate) {
        let f = fixture();
        let r = seed(&f).await;

        let err = f.controller.transition(r.id, update).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition { from: TaskStatus::Pending, .. }
        ));
        assert_eq!(f.store.get_by_id(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn attempt_count_beyond_max_is_rejected() {
        let f = fixture();
        let r = seed(&f).await;
        let err = f
            .controller
            .transition(r.id, TaskUpdate::default().with_attempt_count(MAX + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let f = fixture();
        let err = f
            .controller
            .transition(TaskId::from_ulid(Ulid::new()), TaskUpdate::running())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn transition_refreshes_status_entry_and_drops_record_entry() {
        let f = fixture();
        let r = seed(&f).await;
        // populate
        assert_eq!(f.accessor.read(r.id).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert!(f.cache.contains(&record_key(r.id)));

        f.controller.mark_running(r.id, 0).await.unwrap();

        assert!(!f.cache.contains(&record_key(r.id)));
        assert_eq!(
            f.cache.get(&status_key(r.id)).await.unwrap().as_deref(),
            Some("running")
        );
        assert_eq!(f.accessor.read(r.id).await.unwrap().unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn cache_outage_does_not_fail_transition() {
        let f = fixture();
        let r = seed(&f).await;
        f.cache.set_available(false);

        let t = f.controller.mark_running(r.id, 0).await.unwrap();
        assert!(t.is_applied());
    }

    #[tokio::test]
    async fn store_outage_is_surfaced() {
        let f = fixture();
        let r = seed(&f).await;
        f.store.set_available(false);

        let err = f.controller.mark_running(r.id, 0).await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::Unavailable(_))));
    }
}
