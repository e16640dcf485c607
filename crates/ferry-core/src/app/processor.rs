//! Processor - consumer 側の 1 配送の処理
//!
//! # フロー（received → claimed → executing → completed / retry-scheduled / exhausted）
//! 1. payload を decode（壊れていたら ack して捨てる）
//! 2. (task id, attempt) で claim（取れなければ何もせず ack）
//! 3. LifecycleController で running に（terminal / 古い attempt なら Ignored → ack）
//! 4. kind の handler を実行
//! 5. 成功 → success。失敗 → RetryPolicy が retry か fail を決める
//!
//! store / broker の障害時は claim を返し、`requeue_delay` 待ってから nack(requeue)。
//! 待たないと障害中の配送がキュー先頭で空回りする。handler は再実行されうる（at-least-once）。

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, error, info, info_span, warn};

const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

use crate::app::handler::HandlerRegistry;
use crate::app::retry::{Decision, RetryPolicy};
use crate::app::scheduler::RetryScheduler;
use crate::domain::{ErrorClass, TaskError, TaskRecord, TaskStatus};
use crate::lifecycle::{ClaimKey, IdempotencyGuard, LifecycleController, Transition};
use crate::ports::Delivery;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Payload could not be decoded; dropped.
    Malformed,
    /// Another invocation holds the claim for this delivery.
    Duplicate,
    /// The store has no record for the delivered id.
    Orphaned,
    /// The record had already moved on; nothing ran.
    Skipped(TaskStatus),
    Completed,
    RetryScheduled { next_attempt: u32, delay: Duration },
    Failed { exhausted: bool },
    /// Infrastructure failure; the delivery goes back to the queue.
    Requeue,
}

impl ProcessOutcome {
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            ProcessOutcome::Malformed => Some(ErrorClass::Validation),
            ProcessOutcome::Orphaned => Some(ErrorClass::NotFound),
            ProcessOutcome::Requeue => Some(ErrorClass::Transient),
            ProcessOutcome::Failed { exhausted: true } => Some(ErrorClass::Exhausted),
            ProcessOutcome::Failed { exhausted: false } => Some(ErrorClass::Handler),
            ProcessOutcome::RetryScheduled { .. } => Some(ErrorClass::Handler),
            ProcessOutcome::Duplicate | ProcessOutcome::Skipped(_) | ProcessOutcome::Completed => {
                None
            }
        }
    }
}

pub struct Processor {
    controller: Arc<LifecycleController>,
    guard: Arc<IdempotencyGuard>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    scheduler: Arc<RetryScheduler>,
    requeue_delay: Duration,
}

impl Processor {
    pub fn new(
        controller: Arc<LifecycleController>,
        guard: Arc<IdempotencyGuard>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            controller,
            guard,
            registry,
            policy,
            scheduler,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Process one delivery and settle it with the broker.
    pub async fn process(&self, delivery: Box<dyn Delivery>) -> ProcessOutcome {
        if delivery.redelivered() {
            debug!("processing redelivered message");
        }
        let outcome = self.handle_payload(delivery.payload()).await;
        let settled = match outcome {
            ProcessOutcome::Requeue => {
                tokio::time::sleep(self.requeue_delay).await;
                delivery.nack(true).await
            }
            _ => delivery.ack().await,
        };
        if let Err(e) = settled {
            warn!(error = %e, ?outcome, "failed to settle delivery");
        }
        outcome
    }

    /// Run the lifecycle for one payload without touching the broker.
    pub async fn handle_payload(&self, payload: &[u8]) -> ProcessOutcome {
        let task: TaskRecord = match serde_json::from_slice(payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "dropping malformed delivery");
                return ProcessOutcome::Malformed;
            }
        };
        let span = info_span!(
            "process",
            task_id = %task.id,
            kind = %task.kind,
            attempt = task.attempt_count
        );
        self.execute(task).instrument(span).await
    }

    async fn execute(&self, task: TaskRecord) -> ProcessOutcome {
        let key = ClaimKey::for_record(&task);
        if !self.guard.claim(key).await {
            return ProcessOutcome::Duplicate;
        }

        let attempt = task.attempt_count;
        let running = match self.controller.mark_running(task.id, attempt).await {
            Ok(Transition::Applied(record)) => record,
            Ok(Transition::Ignored(current)) => {
                debug!(status = %current.status, "record already moved on, skipping");
                return ProcessOutcome::Skipped(current.status);
            }
            Err(TaskError::NotFound(_)) => {
                warn!("delivery for a task the store does not know");
                return ProcessOutcome::Orphaned;
            }
            Err(TaskError::InvalidTransition { from, .. }) => {
                warn!(status = %from, "record cannot start running, skipping");
                return ProcessOutcome::Skipped(from);
            }
            Err(e) => return self.requeue(key, "mark running", e).await,
        };

        let Some(handler) = self.registry.resolve(&running.kind) else {
            let reason = format!("no handler registered for task kind '{}'", running.kind);
            return self.finish_failed(key, &running, reason, false).await;
        };

        match handler.handle(&running).await {
            Ok(output) => {
                let output = if output.is_empty() {
                    format!("Task {} completed successfully", running.id)
                } else {
                    output
                };
                match self.controller.complete(running.id, attempt, output).await {
                    Ok(Transition::Applied(_)) => ProcessOutcome::Completed,
                    Ok(Transition::Ignored(current)) => ProcessOutcome::Skipped(current.status),
                    Err(e) => self.requeue(key, "complete", e).await,
                }
            }
            Err(err) => match self.policy.decide(attempt, &err) {
                Decision::Retry {
                    next_attempt,
                    delay,
                } => {
                    warn!(error = %err, next_attempt, ?delay, "attempt failed, retrying");
                    match self.controller.schedule_retry(running.id, attempt).await {
                        Ok(Transition::Applied(pending)) => {
                            if let Err(e) = self.scheduler.schedule(&pending, delay) {
                                // pending のまま残るので reaper が拾う
                                error!(error = %e, "could not schedule retry");
                            }
                            ProcessOutcome::RetryScheduled {
                                next_attempt,
                                delay,
                            }
                        }
                        Ok(Transition::Ignored(current)) => ProcessOutcome::Skipped(current.status),
                        Err(e) => self.requeue(key, "schedule retry", e).await,
                    }
                }
                Decision::Fail { reason, exhausted } => {
                    self.finish_failed(key, &running, reason, exhausted).await
                }
            },
        }
    }

    async fn finish_failed(
        &self,
        key: ClaimKey,
        running: &TaskRecord,
        reason: String,
        exhausted: bool,
    ) -> ProcessOutcome {
        if exhausted {
            info!(reason = %reason, "retries exhausted");
        } else {
            warn!(reason = %reason, "task failed without retry");
        }
        match self
            .controller
            .fail(running.id, running.attempt_count, reason)
            .await
        {
            Ok(Transition::Applied(_)) => ProcessOutcome::Failed { exhausted },
            Ok(Transition::Ignored(current)) => ProcessOutcome::Skipped(current.status),
            Err(e) => self.requeue(key, "fail", e).await,
        }
    }

    async fn requeue(&self, key: ClaimKey, step: &str, e: TaskError) -> ProcessOutcome {
        error!(step, error = %e, "store failure, requeueing delivery");
        self.guard.release(key).await;
        ProcessOutcome::Requeue
    }
}
