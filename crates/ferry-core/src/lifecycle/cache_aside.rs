//! CacheAside - store と cache の間の読み書き規律
//!
//! - read: cache hit ならそのまま返す。miss / cache 障害なら store を読み、cache に入れてから返す
//! - write: 全レコードを入れる（populate）
//! - 変更時は in-place 更新せず invalidate する（LifecycleController が呼ぶ）
//!
//! cache の失敗は全てログに残して握りつぶす。正しさは store だけが担う。
//!
//! # 既知の窓
//! miss した read が古いレコードを読んだ後、並行する遷移の invalidate より
//! 後に write すると、遷移前の値が cache に戻る。戻った値は次の遷移の
//! invalidate か TTL で消える。status エントリも同じ順序の窓を持つ。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{TaskError, TaskId, TaskRecord, TaskStatus};
use crate::ports::{Cache, StoreError, TaskStore};

pub fn record_key(id: TaskId) -> String {
    format!("task:{id}")
}

pub fn status_key(id: TaskId) -> String {
    format!("task_status:{id}")
}

pub struct CacheAside {
    cache: Arc<dyn Cache>,
    store: Arc<dyn TaskStore>,
    ttl: Duration,
}

impl CacheAside {
    pub fn new(cache: Arc<dyn Cache>, store: Arc<dyn TaskStore>, ttl: Duration) -> Self {
        Self { cache, store, ttl }
    }

    /// Read a record, preferring the cache. `Ok(None)` means the store has
    /// no such id.
    #[tracing::instrument(skip_all, fields(task_id = %id))]
    pub async fn read(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let key = record_key(id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<TaskRecord>(&raw) {
                Ok(record) => {
                    debug!("cache hit");
                    return Ok(Some(record));
                }
                Err(e) => {
                    warn!(error = %e, "discarding undecodable cache entry");
                    if let Err(e) = self.cache.delete(&key).await {
                        warn!(error = %e, "failed to delete undecodable cache entry");
                    }
                }
            },
            Ok(None) => debug!("cache miss"),
            Err(e) => warn!(error = %e, "cache read failed, falling back to store"),
        }

        match self.store.get_by_id(id).await {
            Ok(record) => {
                // 並行する invalidate より後に書くと古い値が TTL まで残りうる
                self.write(&record).await;
                Ok(Some(record))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(TaskError::Store(e)),
        }
    }

    /// Populate the full-record entry. Best-effort.
    pub async fn write(&self, record: &TaskRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(task_id = %record.id, error = %e, "failed to encode record for cache");
                return;
            }
        };
        if let Err(e) = self.cache.set(&record_key(record.id), &raw, self.ttl).await {
            warn!(task_id = %record.id, error = %e, "cache populate failed");
        }
    }

    /// Write the status-only entry. Best-effort.
    pub async fn write_status(&self, id: TaskId, status: TaskStatus) {
        if let Err(e) = self.cache.set(&status_key(id), status.as_str(), self.ttl).await {
            warn!(task_id = %id, %status, error = %e, "status cache write failed");
        }
    }

    /// Drop the full-record entry. Best-effort.
    pub async fn invalidate(&self, id: TaskId) {
        if let Err(e) = self.cache.delete(&record_key(id)).await {
            warn!(task_id = %id, error = %e, "cache invalidation failed");
        }
    }

    /// Fast status lookup through the status-only entry, falling back to a
    /// full read.
    pub async fn cached_status(&self, id: TaskId) -> Result<Option<TaskStatus>, TaskError> {
        match self.cache.get(&status_key(id)).await {
            Ok(Some(raw)) => match raw.parse::<TaskStatus>() {
                Ok(status) => return Ok(Some(status)),
                Err(e) => warn!(task_id = %id, error = %e, "ignoring undecodable status entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(task_id = %id, error = %e, "status cache read failed"),
        }
        Ok(self.read(id).await?.map(|record| record.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKind, TaskUpdate};
    use crate::impls::{InMemoryCache, InMemoryTaskStore};
    use chrono::Utc;
    use ulid::Ulid;

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        cache: Arc<InMemoryCache>,
        store: Arc<InMemoryTaskStore>,
        accessor: CacheAside,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let accessor = CacheAside::new(cache.clone(), store.clone(), TTL);
        Fixture {
            cache,
            store,
            accessor,
        }
    }

    fn record() -> TaskRecord {
        TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "hi", Utc::now())
    }

    #[tokio::test]
    async fn miss_reads_store_and_populates() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();

        assert_eq!(f.accessor.read(r.id).await.unwrap(), Some(r.clone()));
        assert!(f.cache.contains(&record_key(r.id)));
    }

    #[tokio::test]
    async fn hit_does_not_touch_store() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();
        f.accessor.read(r.id).await.unwrap();

        f.store.set_available(false);
        assert_eq!(f.accessor.read(r.id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn missing_id_is_none() {
        let f = fixture();
        assert_eq!(f.accessor.read(TaskId::from_ulid(Ulid::new())).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_store() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();
        f.cache.set_available(false);

        assert_eq!(f.accessor.read(r.id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn store_outage_on_miss_is_surfaced() {
        let f = fixture();
        f.store.set_available(false);
        let err = f.accessor.read(TaskId::from_ulid(Ulid::new())).await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn undecodable_entry_is_replaced_from_store() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();
        f.cache.set(&record_key(r.id), "{not json", TTL).await.unwrap();

        assert_eq!(f.accessor.read(r.id).await.unwrap(), Some(r.clone()));
        let cached = f.cache.get(&record_key(r.id)).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<TaskRecord>(&cached).unwrap(), r);
    }

    #[tokio::test]
    async fn invalidate_forces_next_read_to_store() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();
        f.accessor.read(r.id).await.unwrap();

        f.accessor.invalidate(r.id).await;
        assert!(!f.cache.contains(&record_key(r.id)));
    }

    #[tokio::test]
    async fn late_populate_lasts_until_next_invalidate() {
        let f = fixture();
        let old = record();
        f.store.create(&old).await.unwrap();

        // 遷移の invalidate の後に、遷移前に読んだ値の populate が届く
        let update = TaskUpdate::running();
        f.store
            .update_fields(old.id, &update, update.precondition(), Utc::now())
            .await
            .unwrap();
        let newer = f.store.get_by_id(old.id).await.unwrap();
        assert_eq!(newer.status, TaskStatus::Running);
        f.accessor.invalidate(old.id).await;
        f.accessor.write(&old).await;
        assert_eq!(f.accessor.read(old.id).await.unwrap(), Some(old.clone()));

        f.accessor.invalidate(old.id).await;
        assert_eq!(f.accessor.read(old.id).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn cached_status_prefers_status_entry() {
        let f = fixture();
        let r = record();
        f.store.create(&r).await.unwrap();
        f.accessor.write_status(r.id, TaskStatus::Running).await;

        assert_eq!(
            f.accessor.cached_status(r.id).await.unwrap(),
            Some(TaskStatus::Running)
        );

        f.cache.delete(&status_key(r.id)).await.unwrap();
        assert_eq!(
            f.accessor.cached_status(r.id).await.unwrap(),
            Some(TaskStatus::Pending)
        );
    }
}
