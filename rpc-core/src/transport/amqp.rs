use crate::config::Config;
use crate::errors::TransportError;
use crate::transport::backend::{Broker, Delivery, DeliveryReceiver, ExchangeKind};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::{options::*, types::FieldTable, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

/// Real AMQP broker session, backed by a single `lapin::Channel` over a
/// live connection. One `AmqpBroker` is what `ConnectionManager::connect`
/// hands back for a "broker connection" in spec terms.
pub struct AmqpBroker {
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(config: &Config) -> Result<Self, TransportError> {
        let amqp_url = config.amqp_url();
        let connection = timeout(
            CONNECT_TIMEOUT,
            Connection::connect(&amqp_url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| TransportError::Timeout("connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ChannelFailed(e.to_string()))?;

        Ok(Self { channel })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ExchangeDeclarationFailed(e.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    ) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive,
                    auto_delete,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::QueueDeclarationFailed(e.to_string()))?;
        Ok(queue.name().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::QueueBindFailed(format!(
                    "queue={} exchange={} routing_key={}: {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                lapin::BasicProperties::default(),
            )
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryReceiver>, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ConsumerRegistrationFailed(e.to_string()))?;

        Ok(Box::new(AmqpDeliveryReceiver { consumer }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::PublishFailed(format!("ack failed: {}", e)))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue })
            .await
            .map_err(|e| TransportError::PublishFailed(format!("nack failed: {}", e)))
    }
}

struct AmqpDeliveryReceiver {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryReceiver for AmqpDeliveryReceiver {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            return match self.consumer.next().await {
                Some(Ok(delivery)) => Some(Delivery {
                    body: delivery.data.clone(),
                    routing_key: delivery.routing_key.to_string(),
                    exchange: delivery.exchange.to_string(),
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                }),
                Some(Err(e)) => {
                    log::error!("rpc-core: delivery stream error: {}", e);
                    continue;
                }
                None => None,
            };
        }
    }
}
