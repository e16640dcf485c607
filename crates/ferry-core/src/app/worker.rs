use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::app::processor::Processor;
use crate::app::scheduler::RetryScheduler;
use crate::ports::Broker;

/// Worker group handle.
/// - n 本の consumer loop が同じ queue を取り合う
/// - 受信した配送は 1 件ずつ独立した tokio task で処理する
/// - 同時処理数は semaphore で上限をかける
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    in_flight: TaskTracker,
    scheduler: Arc<RetryScheduler>,
}

/// Everything a consumer loop needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub processor: Arc<Processor>,
    pub queue: String,
    pub poll_timeout: Duration,
}

impl WorkerGroup {
    /// Spawn `n` consumer loops sharing at most `max_in_flight` concurrent
    /// deliveries.
    pub fn spawn(
        n: usize,
        max_in_flight: usize,
        ctx: WorkerContext,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let in_flight = TaskTracker::new();

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctx = ctx.clone();
            let permits = Arc::clone(&permits);
            let in_flight = in_flight.clone();
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx, permits, in_flight, &mut rx).await;
            }));
        }
        info!(workers = n, max_in_flight, queue = %ctx.queue, "worker group started");

        Self {
            shutdown_tx,
            joins,
            in_flight,
            scheduler,
        }
    }

    /// Stop taking new deliveries. In-flight processing continues.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop consuming, wait for in-flight deliveries, then flush scheduled
    /// retries.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        self.in_flight.close();
        self.in_flight.wait().await;
        self.scheduler.shutdown().await;
        info!("worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: WorkerContext,
    permits: Arc<Semaphore>,
    in_flight: TaskTracker,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // 空きが出るまで受信しない（受信済みの配送を抱え込まない）
        let permit = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() { break }
                continue;
            }
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // 受信待ちも shutdown と競合させる。落とした配送は broker 側で再配送される
        let received = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() { break }
                continue;
            }
            received = ctx.broker.receive(&ctx.queue, ctx.poll_timeout) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker_id, error = %e, "receive failed, backing off");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    () = tokio::time::sleep(ctx.poll_timeout) => {}
                }
                continue;
            }
        };

        let processor = Arc::clone(&ctx.processor);
        in_flight.spawn(async move {
            let outcome = processor.process(delivery).await;
            debug!(worker_id, ?outcome, "delivery processed");
            drop(permit);
        });
    }
    debug!(worker_id, "worker loop exited");
}
