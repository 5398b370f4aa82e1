use crate::errors::TransportError;
use crate::transport::backend::{Broker, ExchangeKind};
use serde::Serialize;
use std::sync::Arc;

/// Symmetric to `Consumer`: fixes exchange name/type and routing key from a
/// single `topic` (or `msg_id`) argument. Constructed per `send` and
/// dropped (closed) immediately afterward, exactly as spec'd — there is no
/// persistent publisher state to amortize across sends.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    exchange_kind: ExchangeKind,
    routing_key: String,
    durable: bool,
}

impl Publisher {
    pub fn topic(broker: Arc<dyn Broker>, control_exchange: &str, topic: &str) -> Self {
        Self {
            broker,
            exchange: control_exchange.to_string(),
            exchange_kind: ExchangeKind::Topic,
            routing_key: topic.to_string(),
            durable: false,
        }
    }

    pub fn fanout(broker: Arc<dyn Broker>, topic: &str) -> Self {
        Self {
            broker,
            exchange: format!("{}_fanout", topic),
            exchange_kind: ExchangeKind::Fanout,
            routing_key: topic.to_string(),
            durable: false,
        }
    }

    pub fn direct(broker: Arc<dyn Broker>, msg_id: &str) -> Self {
        Self {
            broker,
            exchange: msg_id.to_string(),
            exchange_kind: ExchangeKind::Direct,
            routing_key: msg_id.to_string(),
            durable: false,
        }
    }

    /// Serializes `payload` to JSON and publishes it, declaring the
    /// exchange first (publishers, unlike consumers, never declare a
    /// queue or binding — they assume the consumer side already did).
    ///
    /// If `payload` doesn't serialize cleanly (e.g. a NaN float slipped
    /// into a handler's return value), falls back to a mapping of its
    /// named fields to their string representations — matching nova's
    /// `dict((k, repr(v)) for k, v in reply.__dict__.iteritems())` — rather
    /// than failing the send silently.
    pub async fn send<T>(&self, payload: &T) -> Result<(), TransportError>
    where
        T: Serialize + std::fmt::Debug,
    {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "rpc-core: publisher payload not directly JSON-serializable ({}), falling back to a field repr map",
                    e
                );
                serde_json::to_vec(&fields_to_repr_map(payload)).expect("repr-map fallback is always serializable")
            }
        };
        self.send_bytes(&bytes).await
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.broker
            .declare_exchange(&self.exchange, self.exchange_kind, self.durable, false)
            .await?;
        self.broker.publish(&self.exchange, &self.routing_key, bytes).await
    }
}

/// Builds `{field: repr(value), ...}` from `payload`'s `Debug` output.
/// Rust has no runtime field reflection, so this parses the shape
/// `#[derive(Debug)]` always produces for a struct — `Name { a: .., b: .. }`
/// — splitting on top-level commas and `key: value` on the first `: `.
/// Anything that isn't a struct-shaped debug string (a tuple, a bare
/// value, an enum unit variant) falls back to one `"repr"` key, same as
/// before this split was added.
fn fields_to_repr_map(payload: &impl std::fmt::Debug) -> serde_json::Value {
    let repr = format!("{:?}", payload);
    match split_debug_struct(&repr) {
        Some(fields) => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            serde_json::Value::Object(map)
        }
        None => serde_json::json!({ "repr": repr }),
    }
}

/// Parses `Name { k1: v1, k2: v2 }` into `[(k1, v1), (k2, v2)]`, respecting
/// nested `{}`/`[]`/`""` so a field whose own repr contains a comma doesn't
/// split early. Returns `None` if `repr` isn't that shape.
fn split_debug_struct(repr: &str) -> Option<Vec<(String, String)>> {
    let open = repr.find('{')?;
    let close = repr.rfind('}')?;
    if close <= open {
        return None;
    }
    let body = &repr[open + 1..close];

    let mut fields = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0usize;
    for (i, c) in body.char_indices() {
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => depth -= 1,
            ',' if depth == 0 => {
                push_field(&body[start..i], &mut fields);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_field(&body[start..], &mut fields);
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn push_field(segment: &str, out: &mut Vec<(String, String)>) {
    let segment = segment.trim();
    if segment.is_empty() {
        return;
    }
    match segment.split_once(": ") {
        Some((k, v)) if !k.is_empty() && k.chars().all(|c| c.is_alphanumeric() || c == '_') => {
            out.push((k.trim().to_string(), v.trim().to_string()));
        }
        _ => out.push((out.len().to_string(), segment.to_string())),
    }
}
