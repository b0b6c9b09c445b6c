//! Engine notifications.
//!
//! Listeners call [`Server::subscribe_events`](crate::Server::subscribe_events)
//! and drop the receiver to stop listening.

use braid_protocol::PeerId;
use serde_json::Value;

/// Capacity of the event channel. Slow listeners observe a lag error.
pub const EVENT_CAPACITY: usize = 1024;

/// Something that happened inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A direct peer link was established.
    AddPeer(PeerId),
    /// A direct peer link was lost.
    RemovePeer(PeerId),
    /// Full sync with a direct peer completed.
    PeerSync(PeerId),
    /// A replicated key changed. `None` means deleted.
    DataChange { key: String, value: Option<Value> },
    /// A custom map entry changed. `None` means deleted.
    CustomMapChange {
        name: String,
        key: String,
        value: Option<Value>,
    },
    /// A custom set gained or lost a value.
    CustomSetChange {
        name: String,
        value: Value,
        added: bool,
    },
}
