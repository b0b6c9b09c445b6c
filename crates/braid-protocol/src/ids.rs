//! Identifiers shared across the mesh.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a server node in the mesh.
///
/// Distinct from any socket or connection: a peer keeps its id across
/// reconnects for the lifetime of its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Generate a random peer id.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identity of a single websocket connection.
///
/// Socket ids are random so that they are unique across the whole mesh;
/// publisher sessions and socket-targeted events rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(pub u64);

impl SocketId {
    /// Generate a random socket id.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SocketId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(PeerId::generate(), PeerId::generate());
        assert_ne!(SocketId::generate(), SocketId::generate());
    }

    #[test]
    fn test_socket_id_display() {
        assert_eq!(SocketId(255).to_string(), "00000000000000ff");
        assert_eq!(PeerId(42).to_string(), "42");
    }
}
