use crate::context::{self, RequestContext};
use crate::envelope::{Reply, WireMessage};
use crate::errors::RpcError;
use crate::transport::{Consumer, ConnectionManager, Publisher};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The three RPC verbs. `call` and `cast`/`fanout_cast` share a control
/// exchange (spec's broker topology §6) and a `ConnectionManager`, but
/// otherwise have no shared state — each verb opens and closes its own
/// broker resources per spec.md §4.5.
pub struct RpcClient {
    manager: Arc<ConnectionManager>,
    control_exchange: String,
}

impl RpcClient {
    pub fn new(manager: Arc<ConnectionManager>, control_exchange: impl Into<String>) -> Self {
        Self {
            manager,
            control_exchange: control_exchange.into(),
        }
    }

    /// Packs `ctx` into `msg`, publishes once on `topic`'s topic exchange,
    /// and returns without waiting for (or expecting) a reply.
    pub async fn cast(&self, ctx: &RequestContext, topic: &str, mut msg: WireMessage) -> Result<(), RpcError> {
        context::pack(&mut msg, ctx);
        // Fresh connection per publish, same as every other acquisition
        // site — no two RPC operations share a broker connection.
        let broker = self.manager.instance(true).await?;
        let publisher = Publisher::topic(broker, &self.control_exchange, topic);
        publisher.send(&msg).await?;
        Ok(())
    }

    /// Packs `ctx` into `msg` and publishes on `topic`'s fanout exchange —
    /// every subscriber of `topic` gets its own copy, since each fanout
    /// consumer owns a unique queue (spec.md §3 invariants).
    pub async fn fanout_cast(&self, ctx: &RequestContext, topic: &str, mut msg: WireMessage) -> Result<(), RpcError> {
        context::pack(&mut msg, ctx);
        let broker = self.manager.instance(true).await?;
        let publisher = Publisher::fanout(broker, topic);
        publisher.send(&msg).await?;
        Ok(())
    }

    /// Synthesizes a unique reply-id, spins up an ephemeral exclusive
    /// direct consumer for it, publishes `msg` on `topic`, then waits for
    /// exactly one reply. `deadline` is the opt-in bound on the otherwise
    /// unbounded wait (spec.md §9's open question, resolved in
    /// SPEC_FULL.md §4.5 — `None` preserves the original block-forever
    /// semantics).
    pub async fn call(
        &self,
        ctx: &RequestContext,
        topic: &str,
        mut msg: WireMessage,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        let msg_id = Uuid::new_v4().simple().to_string();
        msg.insert("_msg_id".into(), serde_json::Value::String(msg_id.clone()));
        context::pack(&mut msg, ctx);

        // A `call`'s reply consumer is a fresh, exclusive connection per
        // spec.md §3's invariant that a call's reply-id consumer is
        // exclusive and auto-delete so stale replies can't intermix.
        let broker = self.manager.instance(true).await?;
        let consumer = Consumer::direct(self.manager.clone(), &msg_id).await?;

        let publisher = Publisher::topic(broker, &self.control_exchange, topic);
        publisher.send(&msg).await?;

        let wait = consumer.recv_one();
        let delivery = match deadline {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => wait.await?,
        };

        let Some(delivery) = delivery else {
            // Termination of the underlying iterator is a normal
            // end-of-wait signal, not an error — but it also means we
            // never got a reply, which the caller must be told about.
            return Err(RpcError::NoReply);
        };

        let reply: Reply = serde_json::from_slice(&delivery.body)?;
        match reply.failure {
            Some((exc_type, value, traceback)) => Err(RpcError::Remote(crate::errors::RemoteError {
                exc_type,
                value,
                traceback,
            })),
            None => Ok(reply.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{new_message, with_arg};
    use crate::service::handler::{Handler, HandlerFn};
    use crate::service::runtime::Service;
    use serde_json::{json, Map};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        echo_calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Handler for EchoHandler {
        fn methods(&self) -> HashMap<String, HandlerFn> {
            let mut m: HashMap<String, HandlerFn> = HashMap::new();
            let echo_calls = self.echo_calls.clone();
            m.insert(
                "echo".to_string(),
                Arc::new(move |_ctx, args: Map<String, serde_json::Value>| {
                    let echo_calls = echo_calls.clone();
                    Box::pin(async move {
                        echo_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(args.get("value").cloned().unwrap_or(serde_json::Value::Null))
                    })
                }),
            );
            m.insert(
                "fail".to_string(),
                Arc::new(|_ctx, args: Map<String, serde_json::Value>| {
                    Box::pin(async move {
                        let value = args
                            .get("value")
                            .and_then(|v| v.as_str())
                            .unwrap_or("boom")
                            .to_string();
                        Err(crate::service::handler::HandlerError::new("Exception", value))
                    })
                }),
            );
            m
        }
    }

    async fn running_echo_service() -> (Service, Arc<ConnectionManager>, Arc<AtomicUsize>) {
        let config = Config::for_tests();
        let manager = Arc::new(ConnectionManager::new(config));
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut service = Service::create(
            "host-a".into(),
            "echo-worker".into(),
            "echo".into(),
            Arc::new(EchoHandler { echo_calls: echo_calls.clone() }),
            manager.clone(),
            None,
            None,
        );
        service.start().await.unwrap();
        (service, manager, echo_calls)
    }

    #[tokio::test]
    async fn echo_call_returns_handler_value() {
        let (_service, manager, _echo_calls) = running_echo_service().await;
        let rpc = RpcClient::new(manager, "nova");
        let ctx = RequestContext::anonymous();
        let msg = with_arg(new_message("echo"), "value", json!("hi"));
        let result = rpc.call(&ctx, "echo", msg, None).await.unwrap();
        assert_eq!(result, json!("hi"));
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_remote_error() {
        let (_service, manager, _echo_calls) = running_echo_service().await;
        let rpc = RpcClient::new(manager, "nova");
        let ctx = RequestContext::anonymous();
        let msg = with_arg(new_message("fail"), "value", json!("boom"));
        let err = rpc.call(&ctx, "echo", msg, None).await.unwrap_err();
        match err {
            RpcError::Remote(remote) => {
                assert!(remote.to_string().contains("boom"));
                assert!(remote.to_string().contains("Exception"));
            }
            other => panic!("expected RemoteError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cast_completes_without_reply() {
        let (_service, manager, echo_calls) = running_echo_service().await;
        let rpc = RpcClient::new(manager, "nova");
        let ctx = RequestContext::anonymous();
        let msg = with_arg(new_message("echo"), "value", json!(42));
        rpc.cast(&ctx, "echo", msg).await.unwrap();

        // cast doesn't wait for a reply, so give the service's fetch loop a
        // chance to pick up and run the handler before asserting it did.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(echo_calls.load(Ordering::SeqCst), 1);
    }
}
