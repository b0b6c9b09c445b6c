//! Replication queues exchanged between replicas.
//!
//! A queue is the unit of CRDT state transfer: a list of insertions, each
//! tagged with a unique [`OpId`], and a list of tombstones referencing the
//! insertion id they remove. Full dumps and incremental updates share the
//! same shape.

use crate::ids::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};

/// Unique tag of a single insertion.
///
/// Ordered by counter first and replica second, so concurrent writes with the
/// same counter are tie-broken deterministically by replica identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64, pub u64);

impl OpId {
    /// Create a new operation id.
    #[must_use]
    pub const fn new(counter: u64, replica: u64) -> Self {
        Self(counter, replica)
    }

    /// Logical clock component.
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.0
    }

    /// Replica that generated this id.
    #[must_use]
    pub const fn replica(&self) -> u64 {
        self.1
    }
}

/// A batch of insertions and tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue<K, V> {
    /// `(key, insertion id, value)` triples.
    pub insertions: Vec<(K, OpId, V)>,
    /// `(key, removed insertion id)` pairs.
    pub deletions: Vec<(K, OpId)>,
}

impl<K, V> Default for Queue<K, V> {
    fn default() -> Self {
        Self {
            insertions: Vec::new(),
            deletions: Vec::new(),
        }
    }
}

impl<K: Clone, V: Clone> Queue<K, V> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the queue carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty()
    }

    /// Total number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insertions.len() + self.deletions.len()
    }

    /// Append all operations of another queue.
    pub fn extend(&mut self, other: Queue<K, V>) {
        self.insertions.extend(other.insertions);
        self.deletions.extend(other.deletions);
    }

    /// Split into queues of at most `size` operations each.
    ///
    /// Insertions come first, deletions after, so a receiver applying the
    /// chunks in order never sees a tombstone ahead of the insertion it
    /// removes within the same transfer.
    #[must_use]
    pub fn chunks(&self, size: usize) -> Vec<Queue<K, V>> {
        let size = size.max(1);
        let mut chunks = Vec::new();
        for batch in self.insertions.chunks(size) {
            chunks.push(Queue {
                insertions: batch.to_vec(),
                deletions: Vec::new(),
            });
        }
        for batch in self.deletions.chunks(size) {
            chunks.push(Queue {
                insertions: Vec::new(),
                deletions: batch.to_vec(),
            });
        }
        chunks
    }
}

/// A JSON value usable as a set element.
///
/// Equality and hashing follow the compact JSON rendering, which is
/// canonical because object keys are kept sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetValue(pub Value);

impl PartialEq for SetValue {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SetValue {}

impl Hash for SetValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

impl From<Value> for SetValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// The user-facing key/value store.
pub type DataQueue = Queue<String, Value>;
/// Peer adjacency lists.
pub type PeerQueue = Queue<PeerId, Vec<PeerId>>;
/// Provide or receive patterns registered per peer.
pub type PatternQueue = Queue<PeerId, Vec<String>>;
/// Elected provider per key.
pub type ActiveProviderQueue = Queue<String, (PeerId, String)>;
/// `(peer, key)` pairs for peers with local subscribers.
pub type PeerSubscriptionQueue = Queue<(PeerId, String), ()>;
/// Custom named map.
pub type CustomMapQueue = Queue<String, Value>;
/// Custom named set.
pub type CustomSetQueue = Queue<SetValue, ()>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_id_ordering() {
        assert!(OpId::new(2, 0) > OpId::new(1, 9));
        assert!(OpId::new(1, 2) > OpId::new(1, 1));
        assert_eq!(OpId::new(3, 4).counter(), 3);
        assert_eq!(OpId::new(3, 4).replica(), 4);
    }

    #[test]
    fn test_queue_chunks_insertions_before_deletions() {
        let mut queue: DataQueue = Queue::new();
        for i in 0..250u64 {
            queue
                .insertions
                .push((format!("k{i}"), OpId::new(i, 1), json!(i)));
        }
        queue.deletions.push(("gone".to_string(), OpId::new(1, 2)));

        let chunks = queue.chunks(100);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].insertions.len(), 100);
        assert_eq!(chunks[2].insertions.len(), 50);
        assert!(chunks[3].insertions.is_empty());
        assert_eq!(chunks[3].deletions.len(), 1);
        assert_eq!(chunks.iter().map(Queue::len).sum::<usize>(), queue.len());
    }

    #[test]
    fn test_set_value_hash_is_canonical() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(SetValue(json!({"b": 1, "a": 2})));
        assert!(set.contains(&SetValue(json!({"a": 2, "b": 1}))));
        assert!(!set.contains(&SetValue(json!({"a": 2}))));
    }
}
