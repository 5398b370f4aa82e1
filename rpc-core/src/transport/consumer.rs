use crate::errors::TransportError;
use crate::transport::backend::{Broker, Delivery, DeliveryReceiver, ExchangeKind};
use crate::transport::connection::ConnectionManager;
use futures_util::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One callback invoked per delivery once `fetch` has acked it. In
/// `AdapterConsumer` this is the bounded-pool dispatch closure; in `call`'s
/// direct reply consumer there is no callback at all (it uses `recv_one`
/// instead, see `rpc::RpcClient::call`).
pub type MessageCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Which of the three broker topologies a `Consumer` was built from. Fixes
/// exchange type, queue-name derivation, and routing-key derivation from a
/// single `topic` (or, for `Direct`, `msg_id`) argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// exchange=`<control>`, queue=`<topic>`, routing_key=`<topic>`.
    /// Used both for the shared topic queue and, by passing
    /// `"<topic>.<host>"` as the topic, the per-host addressed queue.
    Topic,
    /// exchange=`<topic>_fanout`, queue=`<topic>_fanout_<uuid>`,
    /// routing_key=`<topic>`.
    Fanout,
    /// exchange=queue=routing_key=`<msg_id>`, exclusive, auto-delete.
    Direct,
}

struct Topology {
    exchange: String,
    exchange_kind: ExchangeKind,
    queue: String,
    routing_key: String,
    durable: bool,
    auto_delete: bool,
    exclusive: bool,
}

fn topology(kind: ConsumerKind, control_exchange: &str, topic: &str) -> Topology {
    match kind {
        ConsumerKind::Topic => Topology {
            exchange: control_exchange.to_string(),
            exchange_kind: ExchangeKind::Topic,
            queue: topic.to_string(),
            routing_key: topic.to_string(),
            durable: false,
            auto_delete: false,
            exclusive: false,
        },
        ConsumerKind::Fanout => Topology {
            exchange: format!("{}_fanout", topic),
            exchange_kind: ExchangeKind::Fanout,
            queue: format!("{}_fanout_{}", topic, uuid::Uuid::new_v4().simple()),
            routing_key: topic.to_string(),
            durable: false,
            auto_delete: false,
            exclusive: false,
        },
        ConsumerKind::Direct => Topology {
            exchange: topic.to_string(),
            exchange_kind: ExchangeKind::Direct,
            queue: topic.to_string(),
            routing_key: topic.to_string(),
            durable: false,
            auto_delete: true,
            exclusive: true,
        },
    }
}

/// A consumer bound to one of the three broker topologies. Retries
/// connection + declare/bind up to `max_retries` times at construction,
/// with a fixed interval between attempts; on exhaustion it returns
/// `TransportError::MaxRetriesExceeded` rather than calling
/// `std::process::exit` itself (library code should not terminate the
/// process — see DESIGN.md). Callers that need spec's "dies if all
/// retries fail" behavior (namely `Service::start`) exit the process
/// themselves on that specific error.
pub struct Consumer {
    manager: Arc<ConnectionManager>,
    broker: Mutex<Arc<dyn Broker>>,
    exchange: String,
    exchange_kind: ExchangeKind,
    queue: String,
    routing_key: String,
    durable: bool,
    auto_delete: bool,
    exclusive: bool,
    failed: AtomicBool,
    logged_failure: AtomicBool,
    receiver: Mutex<Option<Box<dyn DeliveryReceiver>>>,
    callback: Mutex<Option<MessageCallback>>,
}

impl Consumer {
    pub async fn topic(
        manager: Arc<ConnectionManager>,
        control_exchange: &str,
        topic: &str,
    ) -> Result<Self, TransportError> {
        Self::new(manager, ConsumerKind::Topic, control_exchange, topic).await
    }

    pub async fn fanout(manager: Arc<ConnectionManager>, topic: &str) -> Result<Self, TransportError> {
        Self::new(manager, ConsumerKind::Fanout, "", topic).await
    }

    pub async fn direct(manager: Arc<ConnectionManager>, msg_id: &str) -> Result<Self, TransportError> {
        Self::new(manager, ConsumerKind::Direct, "", msg_id).await
    }

    async fn new(
        manager: Arc<ConnectionManager>,
        kind: ConsumerKind,
        control_exchange: &str,
        topic: &str,
    ) -> Result<Self, TransportError> {
        let top = topology(kind, control_exchange, topic);
        let retry_interval = manager.config().rabbit_retry_interval;
        let max_retries = manager.config().rabbit_max_retries;

        let mut attempt = 0u32;
        let (broker, queue_name) = loop {
            match Self::connect_and_declare(&manager, &top).await {
                Ok(pair) => break pair,
                Err(e) => {
                    attempt += 1;
                    if attempt > max_retries {
                        return Err(TransportError::MaxRetriesExceeded(max_retries));
                    }
                    log::warn!(
                        "rpc-core: consumer connect attempt {}/{} failed for queue={}: {}",
                        attempt,
                        max_retries,
                        top.queue,
                        e
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        };

        Ok(Self {
            manager,
            broker: Mutex::new(broker),
            exchange: top.exchange,
            exchange_kind: top.exchange_kind,
            queue: queue_name,
            routing_key: top.routing_key,
            durable: top.durable,
            auto_delete: top.auto_delete,
            exclusive: top.exclusive,
            failed: AtomicBool::new(false),
            logged_failure: AtomicBool::new(false),
            receiver: Mutex::new(None),
            callback: Mutex::new(None),
        })
    }

    async fn connect_and_declare(
        manager: &Arc<ConnectionManager>,
        top: &Topology,
    ) -> Result<(Arc<dyn Broker>, String), TransportError> {
        // Every consumer gets its own fresh connection (spec.md §3: "Every
        // Service owns exactly three broker connections"), never a shared
        // memoized one — mirrors `nova/service.py`'s
        // `rpc.Connection.instance(new=True)` at each of its three
        // consumer-construction sites.
        let broker = manager.instance(true).await?;
        broker
            .declare_exchange(&top.exchange, top.exchange_kind, top.durable, top.auto_delete)
            .await?;
        let queue_name = broker
            .declare_queue(&top.queue, top.durable, top.exclusive, top.auto_delete)
            .await?;
        broker.bind_queue(&queue_name, &top.exchange, &top.routing_key).await?;
        Ok((broker, queue_name))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn set_callback(&self, callback: MessageCallback) {
        *self.callback.lock().await = Some(callback);
    }

    async fn ensure_receiver(&self) -> Result<(), TransportError> {
        let mut guard = self.receiver.lock().await;
        if guard.is_none() {
            let broker = self.broker.lock().await;
            *guard = Some(broker.consume(&self.queue).await?);
        }
        Ok(())
    }

    /// If the connection was previously marked failed, reissue it via
    /// `recreate()`, re-declare exchange/queue/binding, and reset the flag
    /// on first success. Call this before every pull.
    async fn recover_if_failed(&self) -> Result<(), TransportError> {
        if !self.failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let fresh = self.manager.recreate().await?;
        fresh
            .declare_exchange(&self.exchange, self.exchange_kind, self.durable, self.auto_delete)
            .await?;
        let queue_name = fresh
            .declare_queue(&self.queue, self.durable, self.exclusive, self.auto_delete)
            .await?;
        fresh.bind_queue(&queue_name, &self.exchange, &self.routing_key).await?;

        *self.broker.lock().await = fresh;
        *self.receiver.lock().await = None;
        self.failed.store(false, Ordering::SeqCst);
        self.logged_failure.store(false, Ordering::SeqCst);
        log::info!("rpc-core: consumer for queue={} recovered", self.queue);
        Ok(())
    }

    fn note_failure(&self, err: &TransportError) {
        self.failed.store(true, Ordering::SeqCst);
        if !self.logged_failure.swap(true, Ordering::SeqCst) {
            log::error!(
                "rpc-core: consumer for queue={} lost broker connection: {}",
                self.queue,
                err
            );
        }
    }

    /// Drains currently-available messages (non-blocking) and, if
    /// `enable_callbacks` is set, invokes the registered callback for each
    /// after acking it. Any transport error mid-fetch sets the sticky
    /// failed-connection flag and is swallowed (logged at most once per
    /// failure episode) so a persistent outage doesn't produce a log
    /// storm. Returns the number of messages processed.
    pub async fn fetch(&self, enable_callbacks: bool) -> usize {
        if let Err(e) = self.recover_if_failed().await {
            self.note_failure(&e);
            return 0;
        }
        if let Err(e) = self.ensure_receiver().await {
            self.note_failure(&e);
            return 0;
        }

        let mut processed = 0;
        loop {
            let delivery = {
                let mut guard = self.receiver.lock().await;
                let Some(receiver) = guard.as_mut() else { break };
                // Poll once without awaiting: `None` here means "nothing
                // queued right now", not end-of-stream.
                match receiver.recv().now_or_never() {
                    Some(Some(d)) => d,
                    Some(None) => {
                        self.note_failure(&TransportError::StreamEnded);
                        break;
                    }
                    None => break, // nothing currently queued
                }
            };

            let broker = self.broker.lock().await.clone();
            if let Err(e) = broker.ack(delivery.delivery_tag).await {
                self.note_failure(&e);
                break;
            }

            if enable_callbacks {
                if let Some(cb) = self.callback.lock().await.clone() {
                    cb(delivery);
                }
            }
            processed += 1;
        }
        processed
    }

    /// Blocks until `limit` messages have been consumed (acked and, if a
    /// callback is registered, dispatched to it). Used by short-lived
    /// direct reply consumers where `limit` is always 1.
    pub async fn wait(&self, limit: usize) -> Result<usize, TransportError> {
        self.recover_if_failed().await?;
        self.ensure_receiver().await?;

        let mut processed = 0;
        while processed < limit {
            let delivery = {
                let mut guard = self.receiver.lock().await;
                let receiver = guard.as_mut().expect("receiver ensured above");
                receiver.recv().await
            };
            let Some(delivery) = delivery else {
                // Normal end-of-wait signal, not an error.
                break;
            };

            let broker = self.broker.lock().await.clone();
            broker.ack(delivery.delivery_tag).await?;

            if let Some(cb) = self.callback.lock().await.clone() {
                cb(delivery);
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Blocks until exactly one delivery arrives (or the stream ends) and
    /// returns it directly, without going through the callback mechanism.
    /// Used by `call`'s ephemeral reply consumer.
    pub async fn recv_one(&self) -> Result<Option<Delivery>, TransportError> {
        self.recover_if_failed().await?;
        self.ensure_receiver().await?;

        let delivery = {
            let mut guard = self.receiver.lock().await;
            let receiver = guard.as_mut().expect("receiver ensured above");
            receiver.recv().await
        };
        if let Some(d) = &delivery {
            let broker = self.broker.lock().await.clone();
            broker.ack(d.delivery_tag).await?;
        }
        Ok(delivery)
    }
}
