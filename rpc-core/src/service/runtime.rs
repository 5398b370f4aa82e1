use crate::errors::{ServiceError, TransportError};
use crate::service::adapter::build_callback;
use crate::service::handler::Handler;
use crate::service::looping_call::LoopingCall;
use crate::transport::{Consumer, ConnectionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// How often a consumer's fetch loop polls for newly-arrived deliveries.
/// The source's equivalent runs inside an eventlet hub reacting to socket
/// readability; tokio has no direct analogue wired through `Consumer`, so
/// this is a fixed poll tick rather than a config knob.
const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Binds a `Handler` to a broker, opening the three consumers spec.md §4.7
/// describes (the shared topic queue, the per-host addressed topic queue,
/// and the fanout queue) plus the `report_state`/`periodic_tasks` timers.
/// `Service` owns no reconnect logic of its own — that lives in
/// `transport::Consumer` — it only owns the lifecycle of the five
/// `LoopingCall`s that drive it.
pub struct Service {
    host: String,
    binary: String,
    topic: String,
    handler: Arc<dyn Handler>,
    manager: Arc<ConnectionManager>,
    report_interval: Duration,
    periodic_interval: Duration,
    consumers: Vec<Arc<Consumer>>,
    timers: Vec<LoopingCall>,
}

impl Service {
    /// `report_interval`/`periodic_interval` of `None` fall back to the
    /// manager's configuration.
    pub fn create(
        host: String,
        binary: String,
        topic: String,
        handler: Arc<dyn Handler>,
        manager: Arc<ConnectionManager>,
        report_interval: Option<Duration>,
        periodic_interval: Option<Duration>,
    ) -> Self {
        let report_interval = report_interval.unwrap_or(manager.config().report_interval);
        let periodic_interval = periodic_interval.unwrap_or(manager.config().periodic_interval);
        Self {
            host,
            binary,
            topic,
            handler,
            manager,
            report_interval,
            periodic_interval,
            consumers: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Opens the broker consumers, wires the bounded dispatch callback onto
    /// each, and starts all five timers. On exhaustion of a consumer's
    /// connection retries, terminates the process with exit code 1 — a
    /// worker that can never attach to its inbound channel has no useful
    /// work left to do (spec.md §4.2/§4.7).
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        self.handler.init_host();

        let control_exchange = self.manager.config().control_exchange.clone();
        let methods = Arc::new(self.handler.methods());
        let pool_size = self.manager.config().rpc_thread_pool_size.max(1);
        let semaphore = Arc::new(Semaphore::new(pool_size));

        let addressed_topic = format!("{}.{}", self.topic, self.host);

        let mut consumers = Vec::new();
        for topic in [self.topic.as_str(), addressed_topic.as_str()] {
            let consumer = Consumer::topic(self.manager.clone(), &control_exchange, topic).await;
            consumers.push(self.attach_or_die(consumer).await?);
        }
        consumers.push(self.attach_or_die(Consumer::fanout(self.manager.clone(), &self.topic).await).await?);

        for consumer in &consumers {
            consumer
                .set_callback(build_callback(
                    self.handler.clone(),
                    methods.clone(),
                    self.manager.clone(),
                    semaphore.clone(),
                ))
                .await;
        }

        let mut timers = Vec::new();
        for consumer in &consumers {
            let timer = LoopingCall::new();
            let consumer = consumer.clone();
            timer
                .start(
                    format!("fetch[{}]", consumer.queue()),
                    move || {
                        let consumer = consumer.clone();
                        async move {
                            consumer.fetch(true).await;
                            Ok(())
                        }
                    },
                    FETCH_POLL_INTERVAL,
                    true,
                )
                .await;
            timers.push(timer);
        }

        let periodic_timer = LoopingCall::new();
        let handler = self.handler.clone();
        periodic_timer
            .start(
                "periodic_tasks",
                move || {
                    let handler = handler.clone();
                    async move {
                        handler.periodic_tasks().await;
                        Ok(())
                    }
                },
                self.periodic_interval,
                false,
            )
            .await;
        timers.push(periodic_timer);

        let report_timer = LoopingCall::new();
        let handler = self.handler.clone();
        report_timer
            .start(
                "report_state",
                move || {
                    let handler = handler.clone();
                    async move {
                        handler.report_state().await;
                        Ok(())
                    }
                },
                self.report_interval,
                false,
            )
            .await;
        timers.push(report_timer);

        self.consumers = consumers;
        self.timers = timers;
        Ok(())
    }

    async fn attach_or_die(&self, result: Result<Consumer, TransportError>) -> Result<Arc<Consumer>, ServiceError> {
        match result {
            Ok(c) => Ok(Arc::new(c)),
            Err(TransportError::MaxRetriesExceeded(n)) => {
                log::error!(
                    "rpc-core: service '{}' on host '{}' exhausted {} broker connection retries, exiting",
                    self.binary,
                    self.host,
                    n
                );
                std::process::exit(1);
            }
            Err(e) => Err(ServiceError::Transport(e)),
        }
    }

    /// Stops every timer. Failures stopping an individual timer are logged
    /// and otherwise swallowed — a broken timer shouldn't block the others
    /// from shutting down.
    pub async fn stop(&mut self) {
        for timer in self.timers.drain(..) {
            timer.stop().await;
        }
        self.consumers.clear();
    }

    pub async fn kill(&mut self) {
        self.stop().await;
    }

    /// Blocks until every still-running timer's task completes. Since
    /// timers otherwise run forever, this only returns promptly once
    /// `stop()` has been called (concurrently or beforehand).
    pub async fn wait(&mut self) {
        for timer in &self.timers {
            if let Err(e) = timer.wait().await {
                log::warn!("rpc-core: service '{}' timer task ended abnormally: {}", self.binary, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::handler::HandlerFn;
    use serde_json::{Map, Value};
    use std::collections::HashMap;

    struct PingHandler;

    #[async_trait::async_trait]
    impl Handler for PingHandler {
        fn methods(&self) -> HashMap<String, HandlerFn> {
            let mut m: HashMap<String, HandlerFn> = HashMap::new();
            m.insert(
                "ping".to_string(),
                Arc::new(|_ctx, _args: Map<String, Value>| Box::pin(async move { Ok(Value::String("pong".into())) })),
            );
            m
        }
    }

    #[tokio::test]
    async fn start_attaches_three_consumers_and_five_timers() {
        let manager = Arc::new(ConnectionManager::new(Config::for_tests()));
        let mut service = Service::create(
            "host-a".into(),
            "ping-worker".into(),
            "ping".into(),
            Arc::new(PingHandler),
            manager,
            None,
            None,
        );
        service.start().await.unwrap();
        assert_eq!(service.consumers.len(), 3);
        assert_eq!(service.timers.len(), 5);
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_then_wait_returns_promptly() {
        let manager = Arc::new(ConnectionManager::new(Config::for_tests()));
        let mut service = Service::create(
            "host-a".into(),
            "ping-worker".into(),
            "ping".into(),
            Arc::new(PingHandler),
            manager,
            None,
            None,
        );
        service.start().await.unwrap();
        service.stop().await;
        service.wait().await;
    }
}
