//! Broker transport, RPC verbs (`call`/`cast`/`fanout_cast`), and the
//! worker/WSGI service runtimes built on top of them.

pub mod config;
pub mod context;
pub mod envelope;
pub mod errors;
pub mod rpc;
pub mod service;
pub mod transport;

pub use config::Config;
pub use context::RequestContext;
pub use envelope::{Reply, WireMessage};
pub use errors::{RemoteError, RpcError, ServiceError, TransportError};
pub use rpc::RpcClient;
pub use service::{configured_apps, start_many, AppSpec, Handler, HandlerError, Service, WsgiService};
pub use transport::{Broker, ConnectionManager, Consumer, Publisher};
