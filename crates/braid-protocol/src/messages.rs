//! Message types for the braid protocol.
//!
//! Every control and data message exchanged between clients, servers and
//! peers is one variant of [`Message`]. Dump messages carry a replication
//! queue plus the ids of the peers that have already seen them, which bounds
//! gossip flooding.

use crate::dump::{
    ActiveProviderQueue, CustomMapQueue, CustomSetQueue, DataQueue, PatternQueue, PeerQueue,
    PeerSubscriptionQueue,
};
use crate::ids::{PeerId, SocketId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type identifiers, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Credentials,
    CredentialsResponse,
    PeerRequest,
    PeerResponse,
    SubscribeRequest,
    SubscribeResponse,
    Unsubscribe,
    EventSubscribeRequest,
    EventSubscribeResponse,
    EventUnsubscribe,
    PublishRequest,
    PublishResponse,
    Unpublish,
    PublisherMessage,
    PublisherOpen,
    PublisherClose,
    PublisherPeerMessage,
    DataDump,
    ProviderDump,
    ActiveProviderDump,
    ReceiverDump,
    PeerDump,
    PeerSubscriptionDump,
    PeerSync,
    PeerSyncResponse,
    BraidEvent,
    BraidSocketEvent,
    CustomMapDump,
    CustomSetDump,
    MultipartContainer,
}

impl MessageType {
    /// Static name of the message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Credentials => "Credentials",
            MessageType::CredentialsResponse => "CredentialsResponse",
            MessageType::PeerRequest => "PeerRequest",
            MessageType::PeerResponse => "PeerResponse",
            MessageType::SubscribeRequest => "SubscribeRequest",
            MessageType::SubscribeResponse => "SubscribeResponse",
            MessageType::Unsubscribe => "Unsubscribe",
            MessageType::EventSubscribeRequest => "EventSubscribeRequest",
            MessageType::EventSubscribeResponse => "EventSubscribeResponse",
            MessageType::EventUnsubscribe => "EventUnsubscribe",
            MessageType::PublishRequest => "PublishRequest",
            MessageType::PublishResponse => "PublishResponse",
            MessageType::Unpublish => "Unpublish",
            MessageType::PublisherMessage => "PublisherMessage",
            MessageType::PublisherOpen => "PublisherOpen",
            MessageType::PublisherClose => "PublisherClose",
            MessageType::PublisherPeerMessage => "PublisherPeerMessage",
            MessageType::DataDump => "DataDump",
            MessageType::ProviderDump => "ProviderDump",
            MessageType::ActiveProviderDump => "ActiveProviderDump",
            MessageType::ReceiverDump => "ReceiverDump",
            MessageType::PeerDump => "PeerDump",
            MessageType::PeerSubscriptionDump => "PeerSubscriptionDump",
            MessageType::PeerSync => "PeerSync",
            MessageType::PeerSyncResponse => "PeerSyncResponse",
            MessageType::BraidEvent => "BraidEvent",
            MessageType::BraidSocketEvent => "BraidSocketEvent",
            MessageType::CustomMapDump => "CustomMapDump",
            MessageType::CustomSetDump => "CustomSetDump",
            MessageType::MultipartContainer => "MultipartContainer",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a request, as carried by every `*Response` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the request was accepted.
    pub success: bool,
    /// Numeric status code (200 on success).
    pub code: u16,
    /// Human-readable detail.
    pub message: String,
}

impl Outcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            code: 200,
            message: "OK".to_string(),
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
        }
    }
}

/// Complete control-state bundle sent when two peers link up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSyncBundle {
    pub peers: PeerQueue,
    pub providers: PatternQueue,
    pub active_providers: ActiveProviderQueue,
    pub receivers: PatternQueue,
    pub peer_subscriptions: PeerSubscriptionQueue,
    pub custom_maps: Vec<(String, CustomMapQueue)>,
    pub custom_sets: Vec<(String, CustomSetQueue)>,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Credentials submitted by a client or dialing peer.
    Credentials { value: Value },

    /// Result of a credentials submission.
    CredentialsResponse { outcome: Outcome },

    /// Request to promote a socket to a peer link.
    PeerRequest { id: PeerId },

    /// Result of a peer request, carrying the responder's id.
    PeerResponse { id: PeerId, outcome: Outcome },

    /// Subscribe to value updates for a key.
    SubscribeRequest { key: String },

    /// Result of a subscribe request.
    SubscribeResponse { key: String, outcome: Outcome },

    /// Stop receiving updates for a key.
    Unsubscribe { key: String },

    /// Subscribe to a named event channel.
    EventSubscribeRequest { name: String },

    /// Result of an event subscribe request.
    EventSubscribeResponse { name: String, outcome: Outcome },

    /// Stop receiving a named event.
    EventUnsubscribe { name: String },

    /// Open a publisher session for a key.
    PublishRequest { key: String },

    /// Result of a publish request.
    PublishResponse { key: String, outcome: Outcome },

    /// Close a publisher session.
    Unpublish { key: String },

    /// Payload from a publishing client.
    PublisherMessage { key: String, message: Value },

    /// A remote peer opened a publisher session served by the recipient.
    PublisherOpen {
        key: String,
        socket_id: SocketId,
        #[serde(default)]
        credentials: Option<Value>,
    },

    /// A remote publisher session closed.
    PublisherClose { key: String, socket_id: SocketId },

    /// Publisher payload relayed one hop to the serving peer.
    PublisherPeerMessage {
        key: String,
        socket_id: SocketId,
        message: Value,
    },

    /// Changes to the key/value store.
    DataDump { queue: DataQueue, ids: Vec<PeerId> },

    /// Changes to registered provide patterns.
    ProviderDump { queue: PatternQueue, ids: Vec<PeerId> },

    /// Changes to elected providers.
    ActiveProviderDump {
        queue: ActiveProviderQueue,
        ids: Vec<PeerId>,
    },

    /// Changes to registered receive patterns.
    ReceiverDump { queue: PatternQueue, ids: Vec<PeerId> },

    /// Changes to peer adjacency.
    PeerDump { queue: PeerQueue, ids: Vec<PeerId> },

    /// Changes to per-peer subscription markers.
    PeerSubscriptionDump {
        queue: PeerSubscriptionQueue,
        ids: Vec<PeerId>,
    },

    /// Full control-state exchange on link establishment.
    PeerSync { id: PeerId, bundle: PeerSyncBundle },

    /// Acknowledges a [`Message::PeerSync`].
    PeerSyncResponse { id: PeerId },

    /// Named event broadcast to every subscribed client in the mesh.
    BraidEvent {
        name: String,
        args: Vec<Value>,
        id: u64,
        ids: Vec<PeerId>,
    },

    /// Named event addressed to a single socket somewhere in the mesh.
    BraidSocketEvent {
        name: String,
        socket_id: SocketId,
        args: Vec<Value>,
        id: u64,
        ids: Vec<PeerId>,
    },

    /// Changes to a custom named map.
    CustomMapDump {
        name: String,
        queue: CustomMapQueue,
        ids: Vec<PeerId>,
    },

    /// Changes to a custom named set.
    CustomSetDump {
        name: String,
        queue: CustomSetQueue,
        ids: Vec<PeerId>,
    },

    /// One chunk of an encoded message that exceeded the payload ceiling.
    MultipartContainer {
        id: u64,
        position: u32,
        length: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Credentials { .. } => MessageType::Credentials,
            Message::CredentialsResponse { .. } => MessageType::CredentialsResponse,
            Message::PeerRequest { .. } => MessageType::PeerRequest,
            Message::PeerResponse { .. } => MessageType::PeerResponse,
            Message::SubscribeRequest { .. } => MessageType::SubscribeRequest,
            Message::SubscribeResponse { .. } => MessageType::SubscribeResponse,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::EventSubscribeRequest { .. } => MessageType::EventSubscribeRequest,
            Message::EventSubscribeResponse { .. } => MessageType::EventSubscribeResponse,
            Message::EventUnsubscribe { .. } => MessageType::EventUnsubscribe,
            Message::PublishRequest { .. } => MessageType::PublishRequest,
            Message::PublishResponse { .. } => MessageType::PublishResponse,
            Message::Unpublish { .. } => MessageType::Unpublish,
            Message::PublisherMessage { .. } => MessageType::PublisherMessage,
            Message::PublisherOpen { .. } => MessageType::PublisherOpen,
            Message::PublisherClose { .. } => MessageType::PublisherClose,
            Message::PublisherPeerMessage { .. } => MessageType::PublisherPeerMessage,
            Message::DataDump { .. } => MessageType::DataDump,
            Message::ProviderDump { .. } => MessageType::ProviderDump,
            Message::ActiveProviderDump { .. } => MessageType::ActiveProviderDump,
            Message::ReceiverDump { .. } => MessageType::ReceiverDump,
            Message::PeerDump { .. } => MessageType::PeerDump,
            Message::PeerSubscriptionDump { .. } => MessageType::PeerSubscriptionDump,
            Message::PeerSync { .. } => MessageType::PeerSync,
            Message::PeerSyncResponse { .. } => MessageType::PeerSyncResponse,
            Message::BraidEvent { .. } => MessageType::BraidEvent,
            Message::BraidSocketEvent { .. } => MessageType::BraidSocketEvent,
            Message::CustomMapDump { .. } => MessageType::CustomMapDump,
            Message::CustomSetDump { .. } => MessageType::CustomSetDump,
            Message::MultipartContainer { .. } => MessageType::MultipartContainer,
        }
    }

    /// Whether this message may only arrive from a promoted peer socket or
    /// an outbound peer link.
    #[must_use]
    pub fn is_peer_only(&self) -> bool {
        matches!(
            self,
            Message::PublisherOpen { .. }
                | Message::PublisherClose { .. }
                | Message::PublisherPeerMessage { .. }
                | Message::DataDump { .. }
                | Message::ProviderDump { .. }
                | Message::ActiveProviderDump { .. }
                | Message::ReceiverDump { .. }
                | Message::PeerDump { .. }
                | Message::PeerSubscriptionDump { .. }
                | Message::PeerSync { .. }
                | Message::PeerSyncResponse { .. }
                | Message::BraidEvent { .. }
                | Message::BraidSocketEvent { .. }
                | Message::CustomMapDump { .. }
                | Message::CustomSetDump { .. }
        )
    }

    /// Create a Credentials message.
    #[must_use]
    pub fn credentials(value: Value) -> Self {
        Message::Credentials { value }
    }

    /// Create a PeerRequest message.
    #[must_use]
    pub fn peer_request(id: PeerId) -> Self {
        Message::PeerRequest { id }
    }

    /// Create a SubscribeRequest message.
    #[must_use]
    pub fn subscribe(key: impl Into<String>) -> Self {
        Message::SubscribeRequest { key: key.into() }
    }

    /// Create an Unsubscribe message.
    #[must_use]
    pub fn unsubscribe(key: impl Into<String>) -> Self {
        Message::Unsubscribe { key: key.into() }
    }

    /// Create a PublishRequest message.
    #[must_use]
    pub fn publish(key: impl Into<String>) -> Self {
        Message::PublishRequest { key: key.into() }
    }

    /// Create a PublisherMessage message.
    #[must_use]
    pub fn publisher_message(key: impl Into<String>, message: Value) -> Self {
        Message::PublisherMessage {
            key: key.into(),
            message,
        }
    }

    /// Create a DataDump message.
    #[must_use]
    pub fn data_dump(queue: DataQueue, ids: Vec<PeerId>) -> Self {
        Message::DataDump { queue, ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type() {
        assert_eq!(
            Message::subscribe("a").message_type(),
            MessageType::SubscribeRequest
        );
        assert_eq!(
            Message::data_dump(DataQueue::new(), vec![]).message_type(),
            MessageType::DataDump
        );
        assert_eq!(MessageType::PeerSync.to_string(), "PeerSync");
    }

    #[test]
    fn test_peer_only_classification() {
        assert!(Message::data_dump(DataQueue::new(), vec![PeerId(1)]).is_peer_only());
        assert!(Message::PeerSyncResponse { id: PeerId(1) }.is_peer_only());
        assert!(!Message::subscribe("a").is_peer_only());
        assert!(!Message::credentials(json!({"token": "x"})).is_peer_only());
        assert!(!Message::publisher_message("k", json!(1)).is_peer_only());
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(Outcome::ok().success);
        let failed = Outcome::failed(403, "Forbidden");
        assert!(!failed.success);
        assert_eq!(failed.code, 403);
    }
}
