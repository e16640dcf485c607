//! Reaper - 取り残された非終端レコードの再配送
//!
//! 拾うもの:
//! - 「永続化したが publish できなかった」pending
//! - retry の遅延中にプロセスが落ちて失われた再配送（pending）
//! - 実行中に worker が落ちた running。再配送は生きている claim に弾かれて
//!   ack 済みなので、claim の期限切れ後にここで publish し直す
//!
//! 閾値は claim TTL より長い（`FerryConfig::validate`）。
//!
//! # フロー
//! 1. `updated_at` が閾値より古い pending / running を取得
//! 2. 同じ attempt のまま updated_at だけ進める（次の sweep で二重に拾わない）
//! 3. 成功したものだけ publish し直す

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::dispatcher::Dispatcher;
use crate::domain::{TaskError, TaskUpdate};
use crate::lifecycle::{LifecycleController, Transition};
use crate::ports::{Clock, TaskStore};

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    controller: Arc<LifecycleController>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    batch_size: usize,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        controller: Arc<LifecycleController>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            controller,
            dispatcher,
            clock,
            stale_after,
            batch_size,
        }
    }

    /// One pass. Returns how many records were re-published.
    #[tracing::instrument(skip_all)]
    pub async fn sweep(&self) -> Result<usize, TaskError> {
        let age = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| TaskError::Validation(format!("stale threshold out of range: {e}")))?;
        let cutoff = self.clock.now() - age;
        let stale = self.store.list_stale(cutoff, self.batch_size).await?;

        let mut republished = 0;
        for record in stale {
            let touch = TaskUpdate::default().with_attempt_count(record.attempt_count);
            let touched = match self
                .controller
                .transition_guarded(record.id, touch, record.attempt_count)
                .await
            {
                Ok(Transition::Applied(r)) => r,
                Ok(_) => {
                    debug!(task_id = %record.id, "record moved on before reaping");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %record.id, error = %e, "could not touch stale record");
                    continue;
                }
            };
            match self.dispatcher.republish(&touched).await {
                Ok(()) => {
                    debug!(task_id = %record.id, status = %touched.status, "re-published stale task");
                    republished += 1;
                }
                Err(e) => error!(task_id = %record.id, error = %e, "republish failed"),
            }
        }

        if republished > 0 {
            info!(republished, "re-published stale tasks");
        }
        Ok(republished)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "reaper sweep failed");
            }
        }
        debug!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskKind, TaskRecord, TaskStatus};
    use crate::impls::{InMemoryBroker, InMemoryCache, InMemoryTaskStore};
    use crate::lifecycle::CacheAside;
    use crate::ports::{Broker, Delivery, FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        broker: Arc<InMemoryBroker>,
        clock: Arc<FixedClock>,
        reaper: Reaper,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let accessor = Arc::new(CacheAside::new(cache, store.clone(), Duration::from_secs(60)));
        let controller = Arc::new(LifecycleController::new(
            store.clone(),
            accessor.clone(),
            clock.clone(),
            3,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            accessor,
            broker.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock.clone(),
            "q",
        ));
        let reaper = Reaper::new(
            store.clone(),
            controller,
            dispatcher,
            clock.clone(),
            Duration::from_secs(300),
            10,
        );
        Fixture {
            store,
            broker,
            clock,
            reaper,
        }
    }

    #[tokio::test]
    async fn republishes_only_stale_pending_once() {
        let f = fixture();
        let stale = TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "a", f.clock.now());
        f.store.create(&stale).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(10));
        let fresh = TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "b", f.clock.now());
        f.store.create(&fresh).await.unwrap();

        assert_eq!(f.reaper.sweep().await.unwrap(), 1);
        assert_eq!(f.broker.depth("q"), 1);

        // touch 済みなので次の sweep では拾わない
        assert_eq!(f.reaper.sweep().await.unwrap(), 0);
        let touched = f.store.get_by_id(stale.id).await.unwrap();
        assert_eq!(touched.updated_at, f.clock.now());
        assert_eq!(touched.attempt_count, 0);
    }

    #[tokio::test]
    async fn stale_running_is_republished_but_terminal_is_not() {
        let f = fixture();
        let mut running = TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "a", f.clock.now());
        running.status = TaskStatus::Running;
        running.attempt_count = 1;
        f.store.create(&running).await.unwrap();
        let mut done = TaskRecord::new(TaskId::from_ulid(Ulid::new()), TaskKind::new("email"), "b", f.clock.now());
        done.status = TaskStatus::Failed;
        done.result = "gave up".into();
        f.store.create(&done).await.unwrap();
        f.clock.advance(chrono::Duration::hours(1));

        assert_eq!(f.reaper.sweep().await.unwrap(), 1);
        let d = f.broker.receive("q", Duration::from_secs(1)).await.unwrap().unwrap();
        let published: TaskRecord = serde_json::from_slice(d.payload()).unwrap();
        assert_eq!(published.id, running.id);
        assert_eq!(published.status, TaskStatus::Running);
        assert_eq!(published.attempt_count, 1);
        d.ack().await.unwrap();

        assert_eq!(f.store.get_by_id(done.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), f.reaper.run(Duration::from_millis(10), cancel))
            .await
            .unwrap();
    }
}
