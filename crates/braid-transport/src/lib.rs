//! # braid-transport
//!
//! Socket plumbing for the braid key/value sync broker.
//!
//! - **SocketHandle** - Cloneable sender with backpressure accounting and
//!   automatic multipart chunking, shared by inbound sockets and peer links
//! - **PeerLink** - Outbound websocket to a peer with credentials and peer
//!   handshakes plus heartbeat
//! - **Backoff** - Reconnect delays
//!
//! ```rust,ignore
//! use braid_transport::{LinkConfig, PeerLink};
//!
//! let mut link = PeerLink::connect("ws://10.0.0.2:8080/ws", LinkConfig::default()).await?;
//! link.send_credentials(serde_json::json!({"token": "secret"})).await?;
//! let remote = link.send_peer_request(local_id).await?;
//! let (handle, events) = link.into_parts();
//! ```

pub mod backoff;
pub mod error;
pub mod socket;

#[cfg(feature = "websocket")]
pub mod peer_link;

pub use backoff::reconnect_delay;
pub use error::{codes, HandshakeError, TransportError};
pub use socket::{FrameReceiver, OutboundFrame, SocketHandle, SocketLimits};

#[cfg(feature = "websocket")]
pub use peer_link::{LinkConfig, LinkEvent, PeerLink};
