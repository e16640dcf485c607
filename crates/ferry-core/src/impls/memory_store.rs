//! InMemoryTaskStore - テスト用・開発用の正本

use crate::domain::{Precondition, TaskId, TaskRecord, TaskUpdate};
use crate::ports::{StoreError, TaskStore, UpdateOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// HashMap を Mutex で守るだけの TaskStore
///
/// 条件付き更新は 1 回のロック内で precondition の確認と書き込みを行うので、
/// PostgreSQL の `UPDATE ... WHERE` と同じ原子性を持つ。
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: while unavailable, every operation fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.lock()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_fields(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        precondition: Precondition,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut records = self.lock()?;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !precondition.holds(record.status, record.attempt_count) {
            return Ok(UpdateOutcome::Rejected(record.clone()));
        }
        record.apply(update, now);
        Ok(UpdateOutcome::Applied(record.clone()))
    }

    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let records = self.lock()?;
        let mut stale: Vec<TaskRecord> = records
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|r| (r.updated_at, r.id));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKind, TaskStatus};
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(kind: &str) -> TaskRecord {
        TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new(kind), "p", t0())
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = InMemoryTaskStore::new();
        let r = record("email");
        store.create(&r).await.unwrap();
        assert_eq!(store.get_by_id(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = InMemoryTaskStore::new();
        let r = record("email");
        store.create(&r).await.unwrap();
        assert!(matches!(store.create(&r).await, Err(StoreError::Duplicate(id)) if id == r.id));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from_ulid(Ulid::new());
        assert!(matches!(store.get_by_id(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_applies_when_precondition_holds() {
        let store = InMemoryTaskStore::new();
        let r = record("email");
        store.create(&r).await.unwrap();

        let update = TaskUpdate::running();
        let later = t0() + Duration::seconds(1);
        let out = store
            .update_fields(r.id, &update, update.precondition(), later)
            .await
            .unwrap();

        let UpdateOutcome::Applied(written) = out else {
            panic!("expected applied, got {out:?}");
        };
        assert_eq!(written.status, TaskStatus::Running);
        assert_eq!(written.updated_at, later);
        assert_eq!(store.get_by_id(r.id).await.unwrap(), written);
    }

    #[tokio::test]
    async fn update_is_rejected_when_precondition_fails() {
        let store = InMemoryTaskStore::new();
        let r = record("email");
        store.create(&r).await.unwrap();

        // pending -> success は running を経由しないと不可
        let update = TaskUpdate::succeeded("done");
        let out = store
            .update_fields(r.id, &update, update.precondition(), t0())
            .await
            .unwrap();
        assert_eq!(out, UpdateOutcome::Rejected(r.clone()));
        assert_eq!(store.get_by_id(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn stale_active_records_are_oldest_first_and_limited() {
        let store = InMemoryTaskStore::new();
        let mut old = record("a");
        old.updated_at = t0() - Duration::minutes(30);
        let mut older = record("b");
        older.updated_at = t0() - Duration::minutes(60);
        let mut running = record("c");
        running.status = TaskStatus::Running;
        running.updated_at = t0() - Duration::minutes(90);
        let fresh = record("d");
        let mut done = record("e");
        done.status = TaskStatus::Success;
        done.updated_at = t0() - Duration::minutes(120);
        for r in [&old, &older, &running, &fresh, &done] {
            store.create(r).await.unwrap();
        }

        let cutoff = t0() - Duration::minutes(10);
        let stale = store.list_stale(cutoff, 10).await.unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![running.id, older.id, old.id]);

        let limited = store.list_stale(cutoff, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, running.id);
    }

    #[tokio::test]
    async fn switched_off_store_is_unavailable() {
        let store = InMemoryTaskStore::new();
        store.set_available(false);
        let r = record("email");
        assert!(matches!(store.create(&r).await, Err(StoreError::Unavailable(_))));
    }
}
