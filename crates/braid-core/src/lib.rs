//! # braid-core
//!
//! Replicated state and indices for the braid key/value sync broker.
//!
//! This crate provides the data structures the routing engine is built on.
//! Nothing here performs I/O:
//!
//! - **ObservedRemoveMap / ObservedRemoveSet** - CRDTs holding all shared state
//! - **DirectedGraphMap** - Bidirectional edge index
//! - **SessionManager** - Publisher session to serving peer/pattern index
//! - **Election** - Deterministic provider selection per key
//! - **RecentHashes** - Bounded cache for gossip deduplication
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  queue   ┌─────────────┐  changes  ┌─────────────┐
//! │  Peer dump  │─────────▶│   ORMap     │──────────▶│   Engine    │
//! └─────────────┘          └─────────────┘           └─────────────┘
//!                                                           │
//!                                    ┌──────────────────────┼───────────┐
//!                                    ▼                      ▼           ▼
//!                             ┌─────────────┐       ┌────────────┐ ┌─────────┐
//!                             │ GraphMap    │       │ Sessions   │ │Election │
//!                             └─────────────┘       └────────────┘ └─────────┘
//! ```

pub mod crdt;
pub mod dedup;
pub mod election;
pub mod graph;
pub mod session;

pub use crdt::{Change, ObservedRemoveMap, ObservedRemoveSet, SetChange, SetUpdate, Update};
pub use dedup::RecentHashes;
pub use election::{elect, hash32, PatternCache};
pub use graph::DirectedGraphMap;
pub use session::{SessionKey, SessionManager};
