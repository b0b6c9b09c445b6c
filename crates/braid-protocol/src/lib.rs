//! # braid-protocol
//!
//! Wire protocol definitions for the braid key/value synchronization broker.
//!
//! This crate defines the binary protocol spoken between clients, servers
//! and peers: the closed set of message types, the replication queues they
//! carry, the versioned codec and multipart chunking for oversized frames.
//!
//! ## Message Families
//!
//! - `Credentials` / `PeerRequest` - Handshakes
//! - `SubscribeRequest` / `EventSubscribeRequest` / `PublishRequest` - Client requests
//! - `*Dump` - CRDT replication, flooded between peers
//! - `PeerSync` - Full control-state exchange when peers link up
//! - `MultipartContainer` - Chunks of a frame above the payload ceiling
//!
//! ## Example
//!
//! ```rust
//! use braid_protocol::{codec, Message};
//!
//! let message = Message::subscribe("user:1");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod dump;
pub mod ids;
pub mod messages;
pub mod multipart;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use dump::{OpId, Queue, SetValue};
pub use ids::{PeerId, SocketId};
pub use messages::{Message, MessageType, Outcome, PeerSyncBundle};
pub use multipart::{AssemblyLimits, MultipartAssembler};
pub use version::{Version, PROTOCOL_VERSION};
