//! RetryScheduler - 遅延再配送の管理
//!
//! 各 retry は TaskTracker 上の 1 タスク: delay だけ待ってから publish する。
//! shutdown は待機中の delay を打ち切って即 publish し、全部終わるまで待つ。
//! クリーンな停止で retry が失われることはない。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::domain::{TaskError, TaskRecord};
use crate::ports::Broker;

pub struct RetryScheduler {
    broker: Arc<dyn Broker>,
    queue: String,
    tracker: TaskTracker,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish `record` after `delay`. The record is encoded now.
    pub fn schedule(&self, record: &TaskRecord, delay: Duration) -> Result<(), TaskError> {
        let payload = serde_json::to_vec(record)?;
        let broker = self.broker.clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let pending = self.pending.clone();
        let task_id = record.id;
        let attempt = record.attempt_count;

        pending.fetch_add(1, Ordering::SeqCst);
        self.tracker.spawn(async move {
            let flushed = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = cancel.cancelled() => true,
            };
            match broker.publish(&queue, &payload).await {
                Ok(()) => debug!(%task_id, attempt, flushed, "retry published"),
                // record は pending のまま残るので reaper が拾う
                Err(e) => error!(%task_id, attempt, error = %e, "retry publish failed"),
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Retries waiting for their delay or being published.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Publish every pending retry now and wait for all of them.
    /// Retries scheduled afterwards are published without delay.
    pub async fn shutdown(&self) {
        let pending = self.pending();
        if pending > 0 {
            info!(pending, "flushing scheduled retries");
        }
        self.tracker.close();
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskKind};
    use crate::impls::InMemoryBroker;
    use crate::ports::Delivery;
    use chrono::Utc;
    use tokio::time::Instant;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        let mut r = TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "hi", Utc::now());
        r.attempt_count = 1;
        r
    }

    #[tokio::test]
    async fn publishes_after_delay() {
        let broker = Arc::new(InMemoryBroker::new());
        let scheduler = RetryScheduler::new(broker.clone(), "q");

        let start = Instant::now();
        scheduler.schedule(&record(), Duration::from_millis(100)).unwrap();
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(broker.depth("q"), 0);

        let d = broker.receive("q", Duration::from_secs(2)).await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        let got: TaskRecord = serde_json::from_slice(d.payload()).unwrap();
        assert_eq!(got.attempt_count, 1);
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        let scheduler = RetryScheduler::new(broker.clone(), "q");

        scheduler.schedule(&record(), Duration::from_secs(3600)).unwrap();
        scheduler.schedule(&record(), Duration::from_secs(3600)).unwrap();

        let start = Instant::now();
        scheduler.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(broker.depth("q"), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn schedule_after_shutdown_publishes_immediately() {
        let broker = Arc::new(InMemoryBroker::new());
        let scheduler = RetryScheduler::new(broker.clone(), "q");
        scheduler.shutdown().await;

        scheduler.schedule(&record(), Duration::from_secs(3600)).unwrap();
        let d = broker.receive("q", Duration::from_secs(2)).await.unwrap();
        assert!(d.is_some());
    }
}
