//! Codec for encoding and decoding braid messages.
//!
//! Websocket frames are already delimited, so a frame is a three byte header
//! followed by a MessagePack-encoded [`Message`]:
//!
//! - 1 byte: [`FRAME_MARKER`] (`0xc1`, a byte MessagePack never emits first)
//! - 1 byte: protocol major version
//! - 1 byte: protocol minor version
//! - N bytes: MessagePack body

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::messages::Message;
use crate::version::{Version, PROTOCOL_VERSION};

/// First byte of every braid frame.
pub const FRAME_MARKER: u8 = 0xc1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 3;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// Frame without the braid header, as sent by clients predating it.
    #[error("Frame from an outdated client codec")]
    LegacyFrame,

    /// Frame from an incompatible protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(Version),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// Message exceeds a size limit.
    #[error("Message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

impl ProtocolError {
    /// Whether the peer should be told to reload with a current client.
    #[must_use]
    pub fn is_outdated_client(&self) -> bool {
        matches!(
            self,
            ProtocolError::LegacyFrame | ProtocolError::UnsupportedVersion(_)
        )
    }
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(message)?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(FRAME_MARKER);
    buf.put_u8(PROTOCOL_VERSION.major);
    buf.put_u8(PROTOCOL_VERSION.minor);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the frame is truncated, lacks the braid header,
/// carries an incompatible version or does not decode.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Incomplete(HEADER_SIZE));
    }
    if data[0] != FRAME_MARKER {
        return Err(ProtocolError::LegacyFrame);
    }
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    let version = Version::new(data[1], data[2]);
    if !PROTOCOL_VERSION.is_compatible_with(&version) {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let message = rmp_serde::from_slice(&data[HEADER_SIZE..])?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{OpId, PeerSubscriptionQueue, Queue, SetValue};
    use crate::ids::{PeerId, SocketId};
    use crate::messages::{Outcome, PeerSyncBundle};
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut data = Queue::new();
        data.insertions
            .push(("user:1".to_string(), OpId::new(7, 3), json!({"name": "Ada"})));
        data.deletions.push(("user:2".to_string(), OpId::new(5, 3)));

        let mut subscriptions: PeerSubscriptionQueue = Queue::new();
        subscriptions
            .insertions
            .push(((PeerId(9), "user:1".to_string()), OpId::new(1, 9), ()));

        let mut custom_set = Queue::new();
        custom_set
            .insertions
            .push((SetValue(json!([1, 2])), OpId::new(2, 9), ()));

        let messages = vec![
            Message::credentials(json!({"token": "abc"})),
            Message::CredentialsResponse {
                outcome: Outcome::failed(403, "Forbidden"),
            },
            Message::PeerResponse {
                id: PeerId(u64::MAX),
                outcome: Outcome::ok(),
            },
            Message::data_dump(data, vec![PeerId(1), PeerId(2)]),
            Message::PeerSubscriptionDump {
                queue: subscriptions.clone(),
                ids: vec![],
            },
            Message::PublisherOpen {
                key: "k".to_string(),
                socket_id: SocketId(12),
                credentials: None,
            },
            Message::PeerSync {
                id: PeerId(4),
                bundle: PeerSyncBundle {
                    peers: Queue::new(),
                    providers: Queue::new(),
                    active_providers: Queue::new(),
                    receivers: Queue::new(),
                    peer_subscriptions: subscriptions,
                    custom_maps: vec![("m".to_string(), Queue::new())],
                    custom_sets: vec![("s".to_string(), custom_set)],
                },
            },
            Message::MultipartContainer {
                id: 1,
                position: 0,
                length: 2,
                data: vec![0, 1, 2],
            },
        ];

        for message in messages {
            let encoded = encode(&message).unwrap();
            assert_eq!(encoded[0], FRAME_MARKER);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        match decode(&[FRAME_MARKER, 3]) {
            Err(ProtocolError::Incomplete(1)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_frame() {
        let legacy = rmp_serde::to_vec(&(1u8, "hello")).unwrap();
        let err = decode(&legacy).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFrame));
        assert!(err.is_outdated_client());
    }

    #[test]
    fn test_decode_incompatible_version() {
        let mut encoded = encode(&Message::subscribe("a")).unwrap().to_vec();
        encoded[1] = PROTOCOL_VERSION.major + 1;
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(_)));
        assert!(err.is_outdated_client());
    }

    #[test]
    fn test_decode_garbage_body() {
        let err = decode(&[FRAME_MARKER, PROTOCOL_VERSION.major, 0, 0xc1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(!err.is_outdated_client());
    }
}
