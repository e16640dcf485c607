//! Dispatcher - producer 側
//!
//! # フロー
//! 1. id を採番し pending / attempt_count = 0 のレコードを作る
//! 2. store に永続化（失敗なら何も publish しない）
//! 3. cache に record と status を入れる（best-effort）
//! 4. publish。失敗してもレコードは pending のまま残り、呼び出し側には id 付きのエラーを返す

use std::sync::Arc;

use tracing::{error, info};

use crate::domain::{TaskError, TaskKind, TaskRecord, TaskStatus};
use crate::lifecycle::CacheAside;
use crate::ports::{Broker, Clock, IdGenerator, TaskStore};

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    cache: Arc<CacheAside>,
    broker: Arc<dyn Broker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    queue: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cache: Arc<CacheAside>,
        broker: Arc<dyn Broker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            broker,
            ids,
            clock,
            queue: queue.into(),
        }
    }

    #[tracing::instrument(skip(self, payload), fields(task_id))]
    pub async fn submit(&self, kind: &str, payload: &str) -> Result<TaskRecord, TaskError> {
        if kind.trim().is_empty() {
            return Err(TaskError::Validation("kind is required".into()));
        }
        if payload.is_empty() {
            return Err(TaskError::Validation("payload is required".into()));
        }

        let record = TaskRecord::new(
            self.ids.generate_task_id(),
            TaskKind::new(kind.trim()),
            payload,
            self.clock.now(),
        );
        tracing::Span::current().record("task_id", tracing::field::display(record.id));
        let bytes = serde_json::to_vec(&record)?;

        self.store.create(&record).await.map_err(|e| {
            error!(error = %e, "failed to persist task");
            TaskError::Store(e)
        })?;

        self.cache.write(&record).await;
        self.cache.write_status(record.id, TaskStatus::Pending).await;

        if let Err(source) = self.broker.publish(&self.queue, &bytes).await {
            error!(error = %source, "task persisted but not published; left pending");
            return Err(TaskError::Publish {
                id: record.id,
                source,
            });
        }

        info!("task submitted");
        Ok(record)
    }

    /// Publish an existing record again, as it stands.
    pub async fn republish(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let bytes = serde_json::to_vec(record)?;
        self.broker
            .publish(&self.queue, &bytes)
            .await
            .map_err(|source| TaskError::Publish {
                id: record.id,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryBroker, InMemoryCache, InMemoryTaskStore};
    use crate::lifecycle::cache_aside::{record_key, status_key};
    use crate::ports::{Cache, Delivery, StoreError, SystemClock, UlidGenerator};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        cache: Arc<InMemoryCache>,
        broker: Arc<InMemoryBroker>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let accessor = Arc::new(CacheAside::new(cache.clone(), store.clone(), Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(
            store.clone(),
            accessor,
            broker.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            "task_queue",
        );
        Fixture {
            store,
            cache,
            broker,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn submit_persists_caches_and_publishes() {
        let f = fixture();
        let r = f.dispatcher.submit("email", "hi").await.unwrap();

        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.result.is_empty());
        assert_eq!(f.store.get_by_id(r.id).await.unwrap(), r);
        assert!(f.cache.contains(&record_key(r.id)));
        assert_eq!(
            f.cache.get(&status_key(r.id)).await.unwrap().as_deref(),
            Some("pending")
        );

        let d = f
            .broker
            .receive("task_queue", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let published: TaskRecord = serde_json::from_slice(d.payload()).unwrap();
        assert_eq!(published, r);
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn empty_kind_or_payload_is_rejected() {
        let f = fixture();
        assert!(matches!(f.dispatcher.submit("  ", "hi").await, Err(TaskError::Validation(_))));
        assert!(matches!(f.dispatcher.submit("email", "").await, Err(TaskError::Validation(_))));
        assert!(f.store.is_empty());
        assert_eq!(f.broker.published_count(), 0);
    }

    #[tokio::test]
    async fn persist_failure_publishes_nothing() {
        let f = fixture();
        f.store.set_available(false);

        let err = f.dispatcher.submit("email", "hi").await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::Unavailable(_))));
        assert_eq!(f.broker.published_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_leaves_record_pending_and_names_it() {
        let f = fixture();
        f.broker.set_available(false);

        let err = f.dispatcher.submit("email", "hi").await.unwrap_err();
        let TaskError::Publish { id, .. } = err else {
            panic!("expected publish error, got {err:?}");
        };
        let stored = f.store.get_by_id(id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cache_outage_does_not_block_submit() {
        let f = fixture();
        f.cache.set_available(false);
        let r = f.dispatcher.submit("email", "hi").await.unwrap();
        assert_eq!(f.store.get_by_id(r.id).await.unwrap(), r);
        assert_eq!(f.broker.depth("task_queue"), 1);
    }
}
