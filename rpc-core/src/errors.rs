use thiserror::Error;

/// Errors raised while establishing or using a logical broker session
/// (connection, channel, exchange/queue declaration, publish, consume).
///
/// Transport-transient failures (`ConnectionFailed`, `ChannelFailed`, most
/// of the declare/bind variants when raised mid-fetch) are recovered by the
/// consumer's lazy reconnect-and-redeclare path. `MaxRetriesExceeded` is
/// transport-fatal: construction gives up and the caller is expected to
/// terminate the process (see `Consumer::new` and `Service::start`).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),
    #[error("failed to open channel: {0}")]
    ChannelFailed(String),
    #[error("failed to declare exchange: {0}")]
    ExchangeDeclarationFailed(String),
    #[error("failed to declare queue: {0}")]
    QueueDeclarationFailed(String),
    #[error("failed to bind queue: {0}")]
    QueueBindFailed(String),
    #[error("failed to register consumer: {0}")]
    ConsumerRegistrationFailed(String),
    #[error("failed to publish message: {0}")]
    PublishFailed(String),
    #[error("broker operation timed out: {0}")]
    Timeout(String),
    #[error("exhausted {0} connection retries")]
    MaxRetriesExceeded(u32),
    #[error("delivery stream ended")]
    StreamEnded,
    #[error("injected failure")]
    Injected,
}

/// The remote side of a failed `call`: the exception type name, its
/// stringified value, and the formatted traceback lines, exactly as carried
/// in a reply envelope's `failure` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub exc_type: String,
    pub value: String,
    pub traceback: Vec<String>,
}

impl RemoteError {
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

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.value)?;
        if !self.traceback.is_empty() {
            write!(f, "\n{}", self.traceback.join("\n"))?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Errors surfaced by `call` / `cast` / `fanout_cast`. The transport axis
/// (`Transport`, `Timeout`) and the handler axis (`Remote`) are kept
/// disjoint per the propagation policy: a broker hiccup never becomes a
/// `Remote` failure and a handler exception never becomes a `Transport`
/// error.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remote handler raised: {0}")]
    Remote(RemoteError),
    #[error("call deadline elapsed before a reply arrived")]
    Timeout,
    #[error("reply consumer ended without delivering a reply")]
    NoReply,
    #[error("failed to (de)serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the service lifecycle (`start`/`stop`/`wait`) and the WSGI
/// sibling runtime.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to bind wsgi app '{0}': {1}")]
    WsgiBind(String, std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}
