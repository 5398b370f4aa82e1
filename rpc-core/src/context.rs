use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde_json::{Map, Value};

const REQUEST_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-";
const REQUEST_ID_LEN: usize = 20;
const CONTEXT_PREFIX: &str = "_context_";

/// Opaque per-request security/trace data, forwarded transparently across
/// every RPC hop. Packed into an outbound envelope's top-level keys
/// (prefixed `_context_`) and reconstructed on the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub tenant: Option<String>,
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub remote_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl RequestContext {
    /// Builds a fresh context for a new request ingress, with a freshly
    /// generated `request_id` and `timestamp = now`.
    pub fn new(
        tenant: Option<String>,
        user: Option<String>,
        groups: Vec<String>,
        remote_address: Option<String>,
    ) -> Self {
        Self {
            tenant,
            user,
            groups,
            remote_address,
            timestamp: Utc::now(),
            request_id: generate_request_id(),
        }
    }

    /// A context with no tenant/user/address, only a fresh id and
    /// timestamp — convenient for fire-and-forget system-originated casts.
    pub fn anonymous() -> Self {
        Self::new(None, None, Vec::new(), None)
    }

    pub fn to_dict(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("tenant".into(), opt_string(&self.tenant));
        m.insert("user".into(), opt_string(&self.user));
        m.insert(
            "groups".into(),
            Value::Array(self.groups.iter().cloned().map(Value::String).collect()),
        );
        m.insert("remote_address".into(), opt_string(&self.remote_address));
        m.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        m.insert("request_id".into(), Value::String(self.request_id.clone()));
        m
    }
}

fn opt_string(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    (0..REQUEST_ID_LEN)
        .map(|_| REQUEST_ID_CHARSET[rng.gen_range(0..REQUEST_ID_CHARSET.len())] as char)
        .collect()
}

/// Expands `ctx` into `msg`'s top-level keys, each prefixed `_context_`.
/// Values must stay short (<=255 chars) since each occupies a single wire
/// key; this is the caller's responsibility (group lists and addresses are
/// expected to already be small).
pub fn pack(msg: &mut Map<String, Value>, ctx: &RequestContext) {
    // tenant/user/remote_address are always present on the wire, `null`
    // when unset — these are recognized fields a receiver can match on
    // without first checking for the key's existence.
    msg.insert(format!("{}tenant", CONTEXT_PREFIX), opt_string(&ctx.tenant));
    msg.insert(format!("{}user", CONTEXT_PREFIX), opt_string(&ctx.user));
    msg.insert(
        format!("{}groups", CONTEXT_PREFIX),
        Value::Array(ctx.groups.iter().cloned().map(Value::String).collect()),
    );
    msg.insert(
        format!("{}remote_address", CONTEXT_PREFIX),
        opt_string(&ctx.remote_address),
    );
    msg.insert(
        format!("{}timestamp", CONTEXT_PREFIX),
        Value::String(ctx.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    msg.insert(
        format!("{}request_id", CONTEXT_PREFIX),
        Value::String(ctx.request_id.clone()),
    );
}

/// Strips every `_context_*` key out of `msg` (leaving only handler
/// arguments and any reply-id) and reconstructs the `RequestContext` they
/// encoded. Falls back to sensible defaults (empty groups, fresh id) for a
/// message that carries no context at all.
pub fn unpack(msg: &mut Map<String, Value>) -> RequestContext {
    let keys: Vec<String> = msg
        .keys()
        .filter(|k| k.starts_with(CONTEXT_PREFIX))
        .cloned()
        .collect();

    let mut fields: Map<String, Value> = Map::new();
    for key in keys {
        if let Some(value) = msg.remove(&key) {
            let suffix = key[CONTEXT_PREFIX.len()..].to_string();
            fields.insert(suffix, value);
        }
    }

    let tenant = fields.get("tenant").and_then(Value::as_str).map(String::from);
    let user = fields.get("user").and_then(Value::as_str).map(String::from);
    let groups = fields
        .get("groups")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let remote_address = fields
        .get("remote_address")
        .and_then(Value::as_str)
        .map(String::from);
    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let request_id = fields
        .get("request_id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(generate_request_id);

    RequestContext {
        tenant,
        user,
        groups,
        remote_address,
        timestamp,
        request_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_matches_wire_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| REQUEST_ID_CHARSET.contains(&(c as u8))));
    }

    #[test]
    fn pack_unpack_round_trips() {
        let ctx = RequestContext::new(
            Some("tenant-1".into()),
            Some("alice".into()),
            vec!["admins".into(), "ops".into()],
            Some("10.0.0.1".into()),
        );
        let mut msg = Map::new();
        msg.insert("method".into(), Value::String("echo".into()));
        pack(&mut msg, &ctx);

        assert!(msg.contains_key("_context_request_id"));
        assert!(!msg.contains_key("method_context_request_id"));

        let ctx2 = unpack(&mut msg);
        assert_eq!(ctx2.tenant, ctx.tenant);
        assert_eq!(ctx2.user, ctx.user);
        assert_eq!(ctx2.groups, ctx.groups);
        assert_eq!(ctx2.remote_address, ctx.remote_address);
        assert_eq!(ctx2.request_id, ctx.request_id);
        assert_eq!(
            ctx2.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ctx.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
        );

        // residual msg contains only handler arguments
        assert!(!msg.keys().any(|k| k.starts_with(CONTEXT_PREFIX)));
        assert_eq!(msg.get("method").unwrap(), "echo");
    }

    #[test]
    fn unpack_without_context_falls_back_to_defaults() {
        let mut msg = Map::new();
        msg.insert("method".into(), Value::String("ping".into()));
        let ctx = unpack(&mut msg);
        assert!(ctx.groups.is_empty());
        assert_eq!(ctx.request_id.len(), 20);
    }

    #[test]
    fn pack_always_emits_tenant_user_and_remote_address_keys() {
        let ctx = RequestContext::anonymous();
        let mut msg = Map::new();
        pack(&mut msg, &ctx);

        assert_eq!(msg.get("_context_tenant"), Some(&Value::Null));
        assert_eq!(msg.get("_context_user"), Some(&Value::Null));
        assert_eq!(msg.get("_context_remote_address"), Some(&Value::Null));

        let ctx2 = unpack(&mut msg);
        assert_eq!(ctx2.tenant, None);
        assert_eq!(ctx2.user, None);
        assert_eq!(ctx2.remote_address, None);
    }
}
