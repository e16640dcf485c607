//! Broker port - at-least-once delivery of byte payloads on named queues.
//!
//! Consumers compete for messages on a queue. Acknowledgment is manual: a
//! message that is received but never acknowledged (worker crash, dropped
//! delivery) is delivered again.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker connection closed")]
    Closed,
}

/// One received message. The consumer owns it and must `ack` or `nack` it.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Processing finished (successfully or not); drop the message.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Processing did not happen; `requeue` puts the message back.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Persistently enqueue `payload` on `queue`.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message on `queue`.
    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError>;
}
