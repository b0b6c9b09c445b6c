//! Transport and handshake errors.

use braid_protocol::PeerId;
use thiserror::Error;

/// Numeric codes carried by handshake errors and failed outcomes.
pub mod codes {
    /// A request handler returned an error.
    pub const HANDLER_ERROR: u16 = 500;
    /// The link closed before the response arrived.
    pub const CLOSED: u16 = 502;
    /// No response within the handshake timeout.
    pub const TIMEOUT: u16 = 504;
    /// A peer socket with this id is already registered.
    pub const DUPLICATE_PEER_SOCKET: u16 = 801;
    /// An outbound link to this id already exists.
    pub const DUPLICATE_PEER_LINK: u16 = 802;
    /// Close code of an intentional disconnect; never triggers reconnection.
    pub const EXPLICIT_DISCONNECT: u16 = 1000;
    /// Close code used when the server shuts down.
    pub const GOING_AWAY: u16 = 1001;
    /// Close code reported for links that died without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to dial a peer.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] braid_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors of the credentials and peer handshakes.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Credentials were rejected or not answered.
    #[error("Credentials error {code}: {message}")]
    Credentials { code: u16, message: String },

    /// The peer request was rejected or not answered.
    ///
    /// Duplicate-peer rejections carry the id of the already connected peer.
    #[error("Peer error {code}: {message}")]
    Peer {
        code: u16,
        message: String,
        peer_id: Option<PeerId>,
    },

    /// The link closed while a response was pending.
    #[error("Closed before response {code}: {message}")]
    Close { code: u16, message: String },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Numeric code of the error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            HandshakeError::Credentials { code, .. }
            | HandshakeError::Peer { code, .. }
            | HandshakeError::Close { code, .. } => *code,
            HandshakeError::Transport(TransportError::Timeout) => codes::TIMEOUT,
            HandshakeError::Transport(_) => codes::CLOSED,
        }
    }

    /// The existing peer id if this is a duplicate-peer rejection.
    #[must_use]
    pub fn duplicate_peer(&self) -> Option<PeerId> {
        match self {
            HandshakeError::Peer {
                code: codes::DUPLICATE_PEER_SOCKET | codes::DUPLICATE_PEER_LINK,
                peer_id,
                ..
            } => *peer_id,
            _ => None,
        }
    }
}
