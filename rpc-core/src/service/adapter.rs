use crate::context;
use crate::envelope::{self, Reply, WireMessage};
use crate::service::handler::{Handler, HandlerFn};
use crate::transport::{ConnectionManager, Delivery, MessageCallback, Publisher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Builds the per-delivery callback an `AdapterConsumer`'s `Consumer`
/// invokes on every acked message. `MessageCallback` is a plain
/// synchronous `Fn`, so dispatch work is handed to a freshly spawned task;
/// `permits` bounds how many such tasks run concurrently (spec.md §4.4's
/// bounded worker pool), not how many are queued — `tokio::spawn` itself
/// never blocks, so a burst of deliveries queues behind the semaphore
/// rather than backing up the consumer's fetch loop.
pub fn build_callback(
    handler: Arc<dyn Handler>,
    methods: Arc<HashMap<String, HandlerFn>>,
    manager: Arc<ConnectionManager>,
    permits: Arc<Semaphore>,
) -> MessageCallback {
    Arc::new(move |delivery: Delivery| {
        let handler = handler.clone();
        let methods = methods.clone();
        let manager = manager.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            dispatch_one(&handler, &methods, &manager, delivery).await;
        });
    })
}

async fn dispatch_one(
    _handler: &Arc<dyn Handler>,
    methods: &HashMap<String, HandlerFn>,
    manager: &Arc<ConnectionManager>,
    delivery: Delivery,
) {
    let mut msg: WireMessage = match serde_json::from_slice(&delivery.body) {
        Ok(m) => m,
        Err(e) => {
            log::error!("rpc-core: dropping envelope that failed to parse as JSON: {}", e);
            return;
        }
    };

    let msg_id = envelope::msg_id_of(&msg);
    let ctx = context::unpack(&mut msg);

    // A missing/empty `method` and an unregistered one are the same
    // malformed-envelope case: a textual, success-shaped reply carrying
    // "No method for message: ...", never a `failure`. Rejecting an
    // unregistered name the same way as a missing field is spec'd
    // explicitly (no distinct AttributeError-style failure reply).
    let reply = match envelope::method_of(&msg).filter(|m| !m.is_empty() && methods.contains_key(*m)) {
        None => Some(no_method_reply(&msg)),
        Some(method) => {
            let f = methods.get(method).expect("contains_key checked above");
            let args = envelope::args_of(&msg);
            match f(ctx, args).await {
                Ok(value) => Some(Reply::ok(value)),
                Err(e) => Some(Reply::failure(e.exc_type, e.value, e.traceback)),
            }
        }
    };

    // A message with no `_msg_id` is a `cast`/`fanout_cast` — no reply
    // queue exists to publish to, and none is expected.
    let (Some(msg_id), Some(reply)) = (msg_id, reply) else {
        return;
    };

    // Fresh connection, not the shared one the consumer is reading from.
    let broker = match manager.instance(true).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("rpc-core: could not obtain broker to publish reply for {}: {}", msg_id, e);
            return;
        }
    };
    let publisher = Publisher::direct(broker, &msg_id);
    if let Err(e) = publisher.send(&reply).await {
        log::error!("rpc-core: failed to publish reply for {}: {}", msg_id, e);
    }
}

/// A success-shaped reply carrying a textual description of the envelope
/// that couldn't be dispatched — no registered method, no `method` field at
/// all, or an empty one. Matches `nova/rpc.py`'s `msg_reply(msg_id, _('No
/// method for message: %s') % message_data)`: the result is a plain
/// string, `failure` stays `None`.
fn no_method_reply(msg: &WireMessage) -> Reply {
    let rendered = serde_json::to_string(msg).unwrap_or_else(|_| format!("{:?}", msg));
    Reply::ok(serde_json::Value::String(format!(
        "No method for message: {}",
        rendered
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{new_message, with_arg};
    use crate::service::handler::HandlerError;
    use crate::transport::Consumer;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn methods() -> Arc<HashMap<String, HandlerFn>> {
        let mut m: HashMap<String, HandlerFn> = HashMap::new();
        m.insert(
            "echo".to_string(),
            Arc::new(|_ctx, args: Map<String, Value>| {
                Box::pin(async move { Ok(args.get("value").cloned().unwrap_or(Value::Null)) })
            }),
        );
        m.insert(
            "boom".to_string(),
            Arc::new(|_ctx, _args: Map<String, Value>| {
                Box::pin(async move { Err(HandlerError::new("RuntimeError", "boom")) })
            }),
        );
        Arc::new(m)
    }

    struct NoopHandler;
    #[async_trait::async_trait]
    impl Handler for NoopHandler {
        fn methods(&self) -> HashMap<String, HandlerFn> {
            HashMap::new()
        }
    }

    async fn reply_for(msg: WireMessage, msg_id: &str) -> Reply {
        let config = Config::for_tests();
        let manager = Arc::new(ConnectionManager::new(config));
        let reply_consumer = Consumer::direct(manager.clone(), msg_id).await.unwrap();

        let callback = build_callback(Arc::new(NoopHandler), methods(), manager.clone(), Arc::new(Semaphore::new(4)));
        let body = serde_json::to_vec(&msg).unwrap();

        callback(Delivery {
            body,
            routing_key: "echo".into(),
            exchange: "nova".into(),
            delivery_tag: 1,
            redelivered: false,
        });

        let delivery = reply_consumer.recv_one().await.unwrap().unwrap();
        serde_json::from_slice(&delivery.body).unwrap()
    }

    #[tokio::test]
    async fn successful_dispatch_publishes_ok_reply() {
        let mut msg = with_arg(new_message("echo"), "value", json!("hi"));
        msg.insert("_msg_id".into(), Value::String("reply-1".into()));
        let reply = reply_for(msg, "reply-1").await;
        assert_eq!(reply.result, json!("hi"));
        assert!(reply.failure.is_none());
    }

    #[tokio::test]
    async fn handler_error_publishes_failure_reply() {
        let mut msg = new_message("boom");
        msg.insert("_msg_id".into(), Value::String("reply-2".into()));
        let reply = reply_for(msg, "reply-2").await;
        let (exc_type, value, _) = reply.failure.unwrap();
        assert_eq!(exc_type, "RuntimeError");
        assert_eq!(value, "boom");
    }

    #[tokio::test]
    async fn unknown_method_publishes_no_method_result_not_a_failure() {
        let mut msg = new_message("nope");
        msg.insert("_msg_id".into(), Value::String("reply-3".into()));
        let reply = reply_for(msg, "reply-3").await;
        assert!(reply.failure.is_none());
        let result = reply.result.as_str().expect("result is a string");
        assert!(result.contains("No method"));
    }

    #[tokio::test]
    async fn missing_method_field_publishes_no_method_result_not_a_failure() {
        let mut msg = Map::new();
        msg.insert("_msg_id".into(), Value::String("reply-4".into()));
        let reply = reply_for(msg, "reply-4").await;
        assert!(reply.failure.is_none());
        let result = reply.result.as_str().expect("result is a string");
        assert!(result.contains("No method"));
    }

    #[tokio::test]
    async fn cast_without_msg_id_produces_no_reply() {
        let config = Config::for_tests();
        let manager = Arc::new(ConnectionManager::new(config));
        let callback = build_callback(Arc::new(NoopHandler), methods(), manager.clone(), Arc::new(Semaphore::new(4)));

        let msg = with_arg(new_message("echo"), "value", json!(1));
        let body = serde_json::to_vec(&msg).unwrap();
        callback(Delivery {
            body,
            routing_key: "echo".into(),
            exchange: "nova".into(),
            delivery_tag: 7,
            redelivered: false,
        });

        // give the spawned task a chance to run; there is no reply queue
        // to observe, so this only asserts the callback doesn't panic.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
