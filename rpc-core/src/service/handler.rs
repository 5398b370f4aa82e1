use crate::context::RequestContext;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A handler-side failure, the Rust stand-in for the source's exception
/// object. Carries the same three fields a reply's `failure` field needs
/// (spec.md §9's design note on exception→reply mapping): a type tag
/// (conventionally the handler's own name for the failure, e.g.
/// `"ValueError"`), a message, and optional formatted lines standing in
/// for a traceback.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub exc_type: String,
    pub value: String,
    pub traceback: Vec<String>,
}

impl HandlerError {
    pub fn new(exc_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            value: value.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.value)
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A single registered RPC method: takes the caller's context plus
/// normalized arguments, returns a boxed future of the handler's result.
/// Argument keys arrive as plain `String`s (JSON object keys always are)
/// — reproducing spec.md §9's "coerce argument keys to plain strings"
/// workaround comes for free from using `serde_json::Map`.
pub type HandlerFn = Arc<dyn Fn(RequestContext, Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// The user-supplied object whose public methods are the RPC surface of a
/// worker. Implementors build a static `method name -> closure` registry
/// once; `Service::start` calls `methods()` exactly once and hands the
/// result to the `AdapterConsumer`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoked once, before any consumer is attached.
    fn init_host(&self) {}

    /// The method registry dispatched into by every inbound envelope.
    /// Unknown method names are rejected with the same malformed-envelope
    /// reply as an envelope with no `method` field at all — a success-
    /// shaped "No method for message: ..." result, never a failure.
    fn methods(&self) -> HashMap<String, HandlerFn>;

    /// Fired every `periodic_interval` seconds. Default no-op.
    async fn periodic_tasks(&self) {}

    /// Fired every `report_interval` seconds. Default no-op — the source's
    /// base `Service.report_state` is itself a no-op, left for a subclass
    /// (here: a handler) to override.
    async fn report_state(&self) {}
}
