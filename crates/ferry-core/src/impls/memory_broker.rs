//! InMemoryBroker - 開発用・テスト用のブローカー
//!
//! # 学習ポイント
//! - Mutex + Condvar による blocking receive
//! - Async での blocking 処理の扱い（spawn_blocking）
//! - manual ack: 未 ack のメッセージは Drop 時に再キューされる

use crate::ports::{Broker, BrokerError, Delivery};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    unacked: usize,
    published: usize,
}

struct Shared {
    state: Mutex<State>,
    /// publish / requeue 時の通知用
    condvar: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker state poisoned".into()))
    }

    fn requeue(&self, queue: &str, mut message: Message) {
        // Drop からも呼ばれるので poison でも続行する
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.unacked = state.unacked.saturating_sub(1);
        message.redelivered = true;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
        self.condvar.notify_all();
    }

    fn settle(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.unacked = state.unacked.saturating_sub(1);
    }
}

/// InMemoryBroker は queue 名ごとの FIFO を持つ開発用ブローカー
///
/// # 実装詳細
/// - HashMap<String, VecDeque<Message>> でキューを管理
/// - Condvar で publish 時に待機中の receive を起こす
/// - 受信したメッセージは ack / nack されるまで unacked として数える
/// - ack も nack もされずに Drop された配送は先頭に戻る（consumer クラッシュ相当）
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                condvar: Condvar::new(),
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Fault injection: while unavailable, publish and receive fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting on `queue` (not counting unacked ones).
    pub fn depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .map(|s| s.queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Messages received but not yet acked or nacked.
    pub fn unacked(&self) -> usize {
        self.shared.lock().map(|s| s.unacked).unwrap_or(0)
    }

    /// Total successful publishes since creation.
    pub fn published_count(&self) -> usize {
        self.shared.lock().map(|s| s.published).unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker switched off".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.shared.lock()?;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                payload: payload.to_vec(),
                redelivered: false,
            });
        state.published += 1;
        // 複数キューが同じ Condvar を共有するので notify_all
        self.shared.condvar.notify_all();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        self.check_available()?;
        let shared = self.shared.clone();
        let queue = queue.to_string();

        // spawn_blocking で Condvar 待ちを実行（async worker をブロックしないため）
        let delivery = tokio::task::spawn_blocking(move || -> Result<_, BrokerError> {
            let start = std::time::Instant::now();
            let mut guard = shared.lock()?;
            loop {
                if let Some(q) = guard.queues.get_mut(&queue)
                    && let Some(message) = q.pop_front()
                {
                    guard.unacked += 1;
                    drop(guard);
                    return Ok(Some(InMemoryDelivery {
                        shared: shared.clone(),
                        queue,
                        message: Some(message),
                    }));
                }
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Ok(None);
                }
                let (new_guard, _) = shared
                    .condvar
                    .wait_timeout(guard, timeout - elapsed)
                    .map_err(|_| BrokerError::Unavailable("broker state poisoned".into()))?;
                guard = new_guard;
            }
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("receive failed: {e}")))??;

        Ok(delivery.map(|d| Box::new(d) as Box<dyn Delivery>))
    }
}

/// One in-flight message. Requeued on drop unless settled.
pub struct InMemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    message: Option<Message>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.payload.as_slice())
            .unwrap_or(&[])
    }

    fn redelivered(&self) -> bool {
        self.message.as_ref().is_some_and(|m| m.redelivered)
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        if self.message.take().is_some() {
            self.shared.settle();
        }
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if let Some(message) = self.message.take() {
            if requeue {
                self.shared.requeue(&self.queue, message);
            } else {
                self.shared.settle();
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.shared.requeue(&self.queue, message);
        }
    }
}
