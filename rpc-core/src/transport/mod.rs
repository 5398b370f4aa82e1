//! Broker-abstraction layer: a `Broker` trait with a real AMQP backend
//! (`amqp`) and an in-process fake (`fake`) selected via `fake_rabbit`,
//! plus the `Consumer`/`Publisher` primitives built against that trait and
//! the `ConnectionManager` that threads connections to them.

pub mod amqp;
pub mod backend;
pub mod connection;
pub mod consumer;
pub mod fake;
pub mod publisher;

pub use backend::{Broker, Delivery, DeliveryReceiver, ExchangeKind};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerKind, MessageCallback};
pub use publisher::Publisher;
