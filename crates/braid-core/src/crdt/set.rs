//! Observed-remove set.
//!
//! Built on [`ObservedRemoveMap`] with unit values: every `add` creates a
//! fresh insertion tag, so an add concurrent with a remove of an older tag
//! survives the merge.

use braid_protocol::Queue;
use std::hash::Hash;
use std::time::Duration;

use super::map::{ObservedRemoveMap, DEFAULT_TOMBSTONE_MAX_AGE};
use super::Change;

/// A visible change to a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetChange<V> {
    Add(V),
    Delete(V),
}

/// Result of a local set mutation.
#[derive(Debug, Clone)]
pub struct SetUpdate<V> {
    /// Operations to replicate to other peers.
    pub queue: Queue<V, ()>,
    /// Visible change, if any.
    pub change: Option<SetChange<V>>,
}

impl<V> SetUpdate<V> {
    /// Whether nothing needs to be replicated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.insertions.is_empty() && self.queue.deletions.is_empty()
    }
}

fn set_change<V>(change: Change<V, ()>) -> Option<SetChange<V>> {
    match change {
        Change::Set {
            key,
            previous: None,
            ..
        } => Some(SetChange::Add(key)),
        Change::Set { .. } => None,
        Change::Delete { key, .. } => Some(SetChange::Delete(key)),
    }
}

/// A replicated set with observed-remove semantics.
#[derive(Debug, Clone)]
pub struct ObservedRemoveSet<V> {
    map: ObservedRemoveMap<V, ()>,
}

impl<V> ObservedRemoveSet<V>
where
    V: Eq + Hash + Clone,
{
    /// Create an empty set owned by `replica`.
    #[must_use]
    pub fn new(replica: u64) -> Self {
        Self::with_max_age(replica, DEFAULT_TOMBSTONE_MAX_AGE)
    }

    /// Create an empty set with a custom tombstone retention.
    #[must_use]
    pub fn with_max_age(replica: u64, max_age: Duration) -> Self {
        Self {
            map: ObservedRemoveMap::with_max_age(replica, max_age),
        }
    }

    /// Add a value under a fresh tag.
    ///
    /// Re-adding a present value still replicates a new tag, which
    /// re-asserts it against removals other replicas may have in flight.
    pub fn add(&mut self, value: V) -> SetUpdate<V> {
        let update = self.map.set(value, ());
        SetUpdate {
            queue: update.queue,
            change: update.change.and_then(set_change),
        }
    }

    /// Remove a value by tombstoning its observed tag.
    pub fn delete(&mut self, value: &V) -> SetUpdate<V> {
        let update = self.map.delete(value);
        SetUpdate {
            queue: update.queue,
            change: update.change.and_then(set_change),
        }
    }

    /// Merge a remote queue.
    pub fn process(&mut self, queue: Queue<V, ()>) -> Vec<SetChange<V>> {
        self.map
            .process(queue)
            .into_iter()
            .filter_map(set_change)
            .collect()
    }

    /// Full state as a queue.
    #[must_use]
    pub fn dump(&self) -> Queue<V, ()> {
        self.map.dump()
    }

    /// Discard expired tombstones.
    pub fn flush(&mut self) -> usize {
        self.map.flush()
    }

    /// Check if a value is present.
    #[must_use]
    pub fn has(&self, value: &V) -> bool {
        self.map.has(value)
    }

    /// Iterate over present values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.keys()
    }

    /// Number of present values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
