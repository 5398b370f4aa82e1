//! The worker lifecycle: binds a `Handler` to a broker via bounded-pool
//! dispatch (`adapter`), drives periodic work with `looping_call`, and
//! assembles both into the `Service` runtime. `wsgi` is the sibling
//! HTTP-hosting runtime for handlers that also expose a REST surface.

pub mod adapter;
pub mod handler;
pub mod looping_call;
pub mod runtime;
pub mod wsgi;

pub use handler::{Handler, HandlerError, HandlerFn, HandlerFuture};
pub use looping_call::LoopingCall;
pub use runtime::Service;
pub use wsgi::{configured_apps, start_many, AppSpec, WsgiService};
