use crate::errors::TransportError;
use crate::transport::backend::{Broker, Delivery, DeliveryReceiver, ExchangeKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// In-process broker selected when `fake_rabbit` is set. Implements the
/// same `Broker` trait the real AMQP backend does, so `Consumer`/
/// `Publisher`/the RPC layer are identical code paths in tests and
/// production; only `ConnectionManager::connect` picks between them.
///
/// Cloning a `FakeBroker` yields a new handle onto the *same* shared
/// registry — this is how `ConnectionManager::recreate()` simulates a
/// reconnect to the same logical broker rather than losing all state.
#[derive(Clone)]
pub struct FakeBroker {
    registry: Arc<Mutex<Registry>>,
    next_tag: Arc<AtomicU64>,
    fail_next: Arc<AtomicBool>,
    fail_always: Arc<AtomicBool>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

/// A declared queue starts `Pending`, buffering deliveries in FIFO order
/// like a real broker holds them unacked on the queue; the first `consume()`
/// call drains the buffer into a fresh channel and flips it `Active`.
enum QueueState {
    Pending(VecDeque<Delivery>),
    Active(mpsc::UnboundedSender<Delivery>),
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    anonymous_queue_seq: u64,
}

impl Default for ExchangeState {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Direct,
            bindings: Vec::new(),
        }
    }
}

impl FakeBroker {
    pub fn new_shared() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_tag: Arc::new(AtomicU64::new(1)),
            fail_next: Arc::new(AtomicBool::new(false)),
            fail_always: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes exactly the next broker operation on this handle (and any
    /// clone sharing its registry) fail once with `TransportError::Injected`,
    /// then resume working normally. Used to exercise the "broker blip"
    /// scenario: a consumer's next `fetch` should reconnect/redeclare and
    /// keep delivering.
    pub fn inject_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Makes every broker operation on this handle (and any clone sharing
    /// its registry) fail until cleared. Used to exercise retry exhaustion
    /// at `Consumer::new` deterministically, without racing a one-shot
    /// injection against the retry loop's timing.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), TransportError> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(TransportError::Injected);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Injected);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        _auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.maybe_fail()?;
        let mut reg = self.registry.lock().await;
        reg.exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState { kind, bindings: Vec::new() })
            .kind = kind;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _durable: bool,
        _exclusive: bool,
        _auto_delete: bool,
    ) -> Result<String, TransportError> {
        self.maybe_fail()?;
        let mut reg = self.registry.lock().await;
        let resolved = if name.is_empty() {
            reg.anonymous_queue_seq += 1;
            format!("fake-queue-{}", reg.anonymous_queue_seq)
        } else {
            name.to_string()
        };
        reg.queues
            .entry(resolved.clone())
            .or_insert_with(|| QueueState::Pending(VecDeque::new()));
        Ok(resolved)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        self.maybe_fail()?;
        let mut reg = self.registry.lock().await;
        let state = reg
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState {
                kind: ExchangeKind::Direct,
                bindings: Vec::new(),
            });
        // `queue_bind` is idempotent on a real broker: binding the same
        // queue/routing-key pair twice (e.g. the consumer's reconnect-and-
        // redeclare path re-binding after a blip) must not duplicate
        // deliveries.
        let already_bound = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.maybe_fail()?;
        let mut reg = self.registry.lock().await;
        let Some(state) = reg.exchanges.get(exchange) else {
            return Err(TransportError::PublishFailed(format!(
                "no such exchange: {}",
                exchange
            )));
        };

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| match state.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic | ExchangeKind::Direct => b.routing_key == routing_key,
            })
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                body: payload.to_vec(),
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
                delivery_tag: tag,
                redelivered: false,
            };
            // A queue that hasn't been declared at all (shouldn't normally
            // happen — declare_queue always runs first) is simply not a
            // delivery target, matching a real broker's behavior for a
            // nonexistent queue bound to an exchange.
            match reg.queues.get_mut(&queue) {
                Some(QueueState::Active(sender)) => {
                    let _ = sender.send(delivery);
                }
                Some(QueueState::Pending(buffered)) => buffered.push_back(delivery),
                None => {}
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryReceiver>, TransportError> {
        self.maybe_fail()?;
        let mut reg = self.registry.lock().await;
        let buffered = match reg.queues.remove(queue) {
            Some(QueueState::Pending(buffered)) => buffered,
            Some(QueueState::Active(_)) | None => VecDeque::new(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in buffered {
            let _ = tx.send(delivery);
        }
        reg.queues.insert(queue.to_string(), QueueState::Active(tx));
        Ok(Box::new(FakeDeliveryReceiver { rx }))
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
        self.maybe_fail()
    }

    async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
        self.maybe_fail()
    }
}

struct FakeDeliveryReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl DeliveryReceiver for FakeDeliveryReceiver {
    async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_exchange_routes_only_matching_binding() {
        let broker = FakeBroker::new_shared();
        broker
            .declare_exchange("r1", ExchangeKind::Direct, true, true)
            .await
            .unwrap();
        broker.declare_queue("r1", true, true, true).await.unwrap();
        broker.bind_queue("r1", "r1", "r1").await.unwrap();
        let mut rx = broker.consume("r1").await.unwrap();

        broker.publish("r1", "r1", b"hello").await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, b"hello");
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_bound_queue() {
        let broker = FakeBroker::new_shared();
        broker
            .declare_exchange("topic_fanout", ExchangeKind::Fanout, false, false)
            .await
            .unwrap();

        let q1 = broker.declare_queue("topic_fanout_a", false, false, false).await.unwrap();
        let q2 = broker.declare_queue("topic_fanout_b", false, false, false).await.unwrap();
        broker.bind_queue(&q1, "topic_fanout", "topic").await.unwrap();
        broker.bind_queue(&q2, "topic_fanout", "topic").await.unwrap();

        let mut rx1 = broker.consume(&q1).await.unwrap();
        let mut rx2 = broker.consume(&q2).await.unwrap();

        broker.publish("topic_fanout", "topic", b"ping").await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().body, b"ping");
        assert_eq!(rx2.recv().await.unwrap().body, b"ping");
    }

    #[tokio::test]
    async fn publish_before_consume_is_buffered_not_lost() {
        let broker = FakeBroker::new_shared();
        broker
            .declare_exchange("r1", ExchangeKind::Direct, true, true)
            .await
            .unwrap();
        broker.declare_queue("r1", true, true, true).await.unwrap();
        broker.bind_queue("r1", "r1", "r1").await.unwrap();

        // publish lands before anyone has called consume()
        broker.publish("r1", "r1", b"early").await.unwrap();
        broker.publish("r1", "r1", b"later").await.unwrap();

        let mut rx = broker.consume("r1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, b"early");
        assert_eq!(rx.recv().await.unwrap().body, b"later");
    }

    #[tokio::test]
    async fn inject_failure_fails_exactly_one_operation() {
        let broker = FakeBroker::new_shared();
        broker.inject_failure();
        let err = broker
            .declare_exchange("x", ExchangeKind::Topic, false, false)
            .await;
        assert!(err.is_err());

        // the following call succeeds: failure was one-shot
        broker
            .declare_exchange("x", ExchangeKind::Topic, false, false)
            .await
            .unwrap();
    }
}
