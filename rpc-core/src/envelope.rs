use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The wire form of a request: a loosely-typed JSON object carrying
/// `method`, `args`, an optional `_msg_id`, and zero or more
/// `_context_<field>` keys (see `context::pack`/`context::unpack`).
///
/// Kept as a raw `Map` rather than a typed struct because the envelope is
/// mutated in place at each hop (context stripped on receipt, `_msg_id`
/// added by `call`) and its `args` are themselves handler-defined.
pub type WireMessage = Map<String, Value>;

/// Builds an empty envelope for the given method name.
pub fn new_message(method: impl Into<String>) -> WireMessage {
    let mut m = Map::new();
    m.insert("method".into(), Value::String(method.into()));
    m.insert("args".into(), Value::Object(Map::new()));
    m
}

/// Sets a single argument on an envelope built with `new_message`.
pub fn with_arg(mut msg: WireMessage, key: impl Into<String>, value: impl Into<Value>) -> WireMessage {
    let args = msg
        .entry("args")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = args {
        map.insert(key.into(), value.into());
    }
    msg
}

pub fn method_of(msg: &WireMessage) -> Option<&str> {
    msg.get("method").and_then(Value::as_str)
}

pub fn args_of(msg: &WireMessage) -> Map<String, Value> {
    msg.get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

pub fn msg_id_of(msg: &WireMessage) -> Option<String> {
    msg.get("_msg_id").and_then(Value::as_str).map(String::from)
}

/// The reply envelope published back to a `call`'s exclusive direct queue.
/// `failure` is `None` on success; otherwise `(exc_type, value, traceback)`
/// exactly as spec'd, so a client log contains the full remote picture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub result: Value,
    pub failure: Option<(String, String, Vec<String>)>,
}

impl Reply {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            failure: None,
        }
    }

    pub fn failure(exc_type: impl Into<String>, value: impl Into<String>, traceback: Vec<String>) -> Self {
        Self {
            result: Value::Null,
            failure: Some((exc_type.into(), value.into(), traceback)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_carries_method_and_empty_args() {
        let msg = new_message("echo");
        assert_eq!(method_of(&msg), Some("echo"));
        assert!(args_of(&msg).is_empty());
    }

    #[test]
    fn with_arg_inserts_into_args_object() {
        let msg = with_arg(new_message("echo"), "value", Value::from(42));
        let args = args_of(&msg);
        assert_eq!(args.get("value").unwrap(), 42);
    }

    #[test]
    fn reply_round_trips_through_json() {
        let reply = Reply::failure("ValueError", "boom", vec!["line 1".into(), "line 2".into()]);
        let bytes = serde_json::to_vec(&reply).unwrap();
        let decoded: Reply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.failure.unwrap().1, "boom");
    }
}
