//! Engine errors.

use braid_protocol::{ProtocolError, SocketId};
use braid_transport::{HandshakeError, TransportError};
use thiserror::Error;

/// Errors returned by the [`Server`](crate::Server) API.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server is shutting down.
    #[error("Server is closing")]
    Closing,

    /// A provide or receive pattern is not a valid regex.
    #[error("Invalid pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The dialed address belongs to this server.
    #[error("Cannot link to self")]
    SelfLink,

    /// Socket is not registered.
    #[error("Socket not found: {0}")]
    SocketNotFound(SocketId),

    /// Credentials or peer handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Tracking structures still hold entries after teardown.
    #[error("Leaked references: {}", .0.join(", "))]
    LeakedReferences(Vec<String>),
}
