//! Observed-remove CRDTs.
//!
//! Local mutations return an [`Update`]: the queue to replicate plus the
//! visible change it caused. Remote queues are merged with `process`, which
//! returns only the visible changes.

pub mod map;
pub mod set;

use braid_protocol::{OpId, Queue};

pub use map::ObservedRemoveMap;
pub use set::{ObservedRemoveSet, SetChange, SetUpdate};

/// A visible change to a map.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K, V> {
    /// A key was set.
    Set {
        key: K,
        id: OpId,
        value: V,
        previous: Option<V>,
    },
    /// A key was removed.
    Delete { key: K, id: OpId, previous: V },
}

impl<K, V> Change<K, V> {
    /// The key this change applies to.
    #[must_use]
    pub fn key(&self) -> &K {
        match self {
            Change::Set { key, .. } | Change::Delete { key, .. } => key,
        }
    }
}

/// Result of a local mutation.
#[derive(Debug, Clone)]
pub struct Update<K, V> {
    /// Operations to replicate to other peers.
    pub queue: Queue<K, V>,
    /// Visible change, if any.
    pub change: Option<Change<K, V>>,
}

impl<K, V> Update<K, V> {
    /// An update that changed nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            queue: Queue::default(),
            change: None,
        }
    }

    /// Whether nothing needs to be replicated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.insertions.is_empty() && self.queue.deletions.is_empty()
    }
}
