//! # braid-server
//!
//! A distributed key/value synchronization broker.
//!
//! Servers link into a mesh of peers and replicate a key/value map plus the
//! control state that routes work between them: which peer provides values
//! for a key, which peer receives publisher sessions, and which peers have
//! subscribers. Clients connect over websockets to subscribe to keys, listen
//! to named events and publish messages to receivers anywhere in the mesh.
//!
//! ```rust,no_run
//! use braid_server::{Server, ServerConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), braid_server::ServerError> {
//! let server = Server::new(ServerConfig::default());
//! server.set("greeting", json!("hello"));
//! server.connect_to_peer("ws://10.0.0.2:8080/ws", json!({"token": "secret"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
mod server;

pub use auth::{
    CredentialsRequest, EventSubscribeRequest, HandlerError, PeerRequest, PublishRequest,
    RequestHandler, SubscribeRequest,
};
pub use config::Config;
pub use error::ServerError;
pub use events::ServerEvent;
pub use server::{
    CloseCallback, CustomMap, CustomSet, MessageCallback, OpenCallback, ProvideCallback,
    ProvideOptions, Server, ServerConfig,
};

pub use braid_protocol::{Outcome, PeerId, SocketId};
