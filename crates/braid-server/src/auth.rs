//! Request handler hooks.
//!
//! The engine asks the embedding application before accepting credentials,
//! peer links, subscriptions, event subscriptions and publisher sessions.
//! A handler is anything implementing [`RequestHandler`], including plain
//! async closures:
//!
//! ```rust,ignore
//! server.set_subscribe_request_handler(|request: SubscribeRequest| async move {
//!     if request.key.starts_with("private:") {
//!         return Ok(Outcome::failed(403, "Forbidden"));
//!     }
//!     Ok(Outcome::ok())
//! });
//! ```
//!
//! Without a handler every request is accepted. A handler returning `Err`
//! or panicking is answered with a 500 outcome.

use async_trait::async_trait;
use braid_protocol::{Outcome, PeerId, SocketId};
use braid_transport::codes;
use futures_util::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use crate::metrics;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Credentials submitted by a socket.
#[derive(Debug, Clone)]
pub struct CredentialsRequest {
    pub socket_id: SocketId,
    pub ip: Option<IpAddr>,
    pub credentials: Value,
}

/// A socket asking to become a peer link.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub socket_id: SocketId,
    pub peer_id: PeerId,
    pub credentials: Option<Value>,
}

/// A socket subscribing to a key.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub socket_id: SocketId,
    pub key: String,
    pub credentials: Option<Value>,
}

/// A socket subscribing to a named event.
#[derive(Debug, Clone)]
pub struct EventSubscribeRequest {
    pub socket_id: SocketId,
    pub name: String,
    pub credentials: Option<Value>,
}

/// A socket opening a publisher session.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub socket_id: SocketId,
    pub key: String,
    pub credentials: Option<Value>,
}

/// Decides whether a request is accepted.
#[async_trait]
pub trait RequestHandler<R>: Send + Sync {
    /// Handle a request.
    async fn handle(&self, request: R) -> Result<Outcome, HandlerError>;
}

#[async_trait]
impl<R, F, Fut> RequestHandler<R> for F
where
    R: Send + 'static,
    F: Fn(R) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    async fn handle(&self, request: R) -> Result<Outcome, HandlerError> {
        (self)(request).await
    }
}

/// Installed handlers.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub credentials: Option<Arc<dyn RequestHandler<CredentialsRequest>>>,
    pub peer: Option<Arc<dyn RequestHandler<PeerRequest>>>,
    pub subscribe: Option<Arc<dyn RequestHandler<SubscribeRequest>>>,
    pub event_subscribe: Option<Arc<dyn RequestHandler<EventSubscribeRequest>>>,
    pub publish: Option<Arc<dyn RequestHandler<PublishRequest>>>,
}

/// Run a handler, converting errors and panics into a 500 outcome.
pub(crate) async fn run<R>(
    handler: Option<Arc<dyn RequestHandler<R>>>,
    request: R,
    kind: &'static str,
) -> Outcome
where
    R: Send + 'static,
{
    let Some(handler) = handler else {
        return Outcome::ok();
    };
    let start = Instant::now();
    let result = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;
    metrics::record_handler_latency(kind, start.elapsed().as_secs_f64());
    match result {
        Ok(Ok(outcome)) => return outcome,
        Ok(Err(e)) => error!(handler = kind, error = ?e, "Handler error"),
        Err(_) => error!(handler = kind, "Handler panicked"),
    }
    metrics::record_error("handler");
    Outcome::failed(codes::HANDLER_ERROR, format!("{kind} handler error"))
}
