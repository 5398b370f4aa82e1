use crate::errors::TransportError;
use async_trait::async_trait;

/// The three broker exchange kinds this core ever declares. Mirrors
/// `lapin::ExchangeKind` but is backend-agnostic so the fake in-process
/// broker doesn't need to depend on lapin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
    Direct,
}

/// A single inbound delivery, decoupled from whichever backend produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Pulls deliveries off a previously-registered consumer. One receiver per
/// `basic_consume` call; dropped when the consumer is closed.
#[async_trait]
pub trait DeliveryReceiver: Send {
    /// Returns the next delivery, or `None` if the underlying stream ended
    /// (broker closed the channel, auto-delete queue reclaimed, etc). Per
    /// spec, stream termination is a normal end-of-wait signal, not itself
    /// an error.
    async fn recv(&mut self) -> Option<Delivery>;
}

/// Broker-abstraction trait implemented by the real AMQP backend
/// (`transport::amqp::AmqpBroker`) and the in-process fake
/// (`transport::fake::FakeBroker`) selected by the `fake_rabbit`
/// configuration flag. Every `Consumer`/`Publisher` is written against this
/// trait and is otherwise unaware of which backend it got.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError>;

    /// Declares a queue and returns its actual name (the fake backend, like
    /// a real broker asked for an empty name, may generate one).
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    ) -> Result<String, TransportError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryReceiver>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}
