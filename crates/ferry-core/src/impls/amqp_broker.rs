//! AmqpBroker - RabbitMQ 上の Broker 実装（feature = "amqp"）
//!
//! - キューは durable、メッセージは delivery_mode = 2（永続）
//! - channel は confirm モード。broker が Ack を返すまで publish は成功にしない
//! - 受信は `basic_get`（no_ack = false）のポーリング
//! - ack / nack は delivery tag で行う。未 ack のまま channel が閉じれば再配送

use crate::ports::{Broker, BrokerError, Delivery};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

fn unavailable(context: &str, e: lapin::Error) -> BrokerError {
    match e {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            BrokerError::Closed
        }
        other => BrokerError::Unavailable(format!("{context}: {other}")),
    }
}

fn confirmed(queue: &str, confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(BrokerError::Unavailable(format!(
            "broker nacked publish to {queue}"
        ))),
        Confirmation::NotRequested => Err(BrokerError::Unavailable(
            "publisher confirms are not enabled on the channel".into(),
        )),
    }
}

pub struct AmqpBroker {
    _connection: Connection,
    channel: Channel,
    declared: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl AmqpBroker {
    pub async fn connect(amqp_url: &str, prefetch: u16) -> Result<Self, BrokerError> {
        let connection = Connection::connect(
            amqp_url,
            ConnectionProperties::default().with_connection_name("ferry".into()),
        )
        .await
        .map_err(|e| unavailable("connect", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| unavailable("create channel", e))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| unavailable("set qos", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| unavailable("enable publisher confirms", e))?;

        info!(prefetch, "Connected to AMQP broker");
        Ok(Self {
            _connection: connection,
            channel,
            declared: Mutex::new(HashSet::new()),
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| unavailable("declare queue", e))?;
        declared.insert(queue.to_string());
        debug!(queue, "Declared durable queue");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_queue(queue).await?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| unavailable("publish", e))?;
        let confirmation = confirm
            .await
            .map_err(|e| unavailable("publish confirmation", e))?;
        confirmed(queue, confirmation)
    }

    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        self.ensure_queue(queue).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let message = self
                .channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| unavailable("basic_get", e))?;

            if let Some(message) = message {
                return Ok(Some(Box::new(AmqpDelivery {
                    channel: self.channel.clone(),
                    delivery_tag: message.delivery.delivery_tag,
                    data: message.delivery.data,
                    redelivered: message.delivery.redelivered,
                })));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

pub struct AmqpDelivery {
    channel: Channel,
    delivery_tag: u64,
    data: Vec<u8>,
    redelivered: bool,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| unavailable("ack", e))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| unavailable("nack", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_acked_publishes_succeed() {
        assert!(confirmed("q", Confirmation::Ack(None)).is_ok());
        assert!(matches!(
            confirmed("q", Confirmation::Nack(None)),
            Err(BrokerError::Unavailable(msg)) if msg.contains("nacked")
        ));
        assert!(matches!(
            confirmed("q", Confirmation::NotRequested),
            Err(BrokerError::Unavailable(_))
        ));
    }

    // 実 RabbitMQ が必要: FERRY_TEST_AMQP_URL=amqp://127.0.0.1:5672 cargo test --features amqp
    #[tokio::test]
    async fn publish_receive_ack_against_real_rabbitmq() {
        let Ok(url) = std::env::var("FERRY_TEST_AMQP_URL") else {
            eprintln!("Skipping test: set FERRY_TEST_AMQP_URL to enable.");
            return;
        };
        let broker = AmqpBroker::connect(&url, 10).await.unwrap();
        let queue = format!("ferry_test_{}", ulid::Ulid::new());

        broker.publish(&queue, b"hello").await.unwrap();
        let first = broker.receive(&queue, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.payload(), b"hello");
        first.nack(true).await.unwrap();

        let second = broker.receive(&queue, Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(second.redelivered());
        second.ack().await.unwrap();

        assert!(broker.receive(&queue, Duration::from_millis(200)).await.unwrap().is_none());
    }
}
