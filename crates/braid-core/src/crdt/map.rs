//! Observed-remove map.
//!
//! Each key holds at most one live insertion. An insertion is applied only
//! if its id is greater than every id already observed for the key, live or
//! tombstoned; a tombstone removes the live insertion when it references an
//! id at least as new. The visible state is therefore "the highest insertion
//! id for the key, unless that id has been tombstoned", which is independent
//! of delivery order and of duplicate delivery.

use braid_protocol::{OpId, Queue};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{Change, Update};

/// Default retention of tombstones before [`ObservedRemoveMap::flush`]
/// discards them.
pub const DEFAULT_TOMBSTONE_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Tombstone {
    id: OpId,
    at: Instant,
}

/// A replicated map with observed-remove semantics.
#[derive(Debug, Clone)]
pub struct ObservedRemoveMap<K, V> {
    replica: u64,
    clock: u64,
    pairs: HashMap<K, (OpId, V)>,
    tombstones: HashMap<K, Tombstone>,
    max_age: Duration,
    mutations: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl<K, V> ObservedRemoveMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map owned by `replica`.
    #[must_use]
    pub fn new(replica: u64) -> Self {
        Self::with_max_age(replica, DEFAULT_TOMBSTONE_MAX_AGE)
    }

    /// Create an empty map with a custom tombstone retention.
    #[must_use]
    pub fn with_max_age(replica: u64, max_age: Duration) -> Self {
        Self {
            replica,
            clock: 0,
            pairs: HashMap::new(),
            tombstones: HashMap::new(),
            max_age,
            mutations: 0,
        }
    }

    fn next_id(&mut self) -> OpId {
        self.clock = (self.clock + 1).max(now_millis());
        OpId::new(self.clock, self.replica)
    }

    fn observe(&mut self, id: OpId) {
        self.clock = self.clock.max(id.counter());
    }

    /// Highest id observed for a key, live or tombstoned.
    fn floor(&self, key: &K) -> Option<OpId> {
        let live = self.pairs.get(key).map(|(id, _)| *id);
        let dead = self.tombstones.get(key).map(|t| t.id);
        live.max(dead)
    }

    /// Set a key, superseding any prior insertion.
    pub fn set(&mut self, key: K, value: V) -> Update<K, V> {
        let id = self.next_id();
        let previous = self
            .pairs
            .insert(key.clone(), (id, value.clone()))
            .map(|(_, v)| v);
        self.tombstones.remove(&key);
        self.mutations += 1;

        let mut queue = Queue::new();
        queue.insertions.push((key.clone(), id, value.clone()));
        Update {
            queue,
            change: Some(Change::Set {
                key,
                id,
                value,
                previous,
            }),
        }
    }

    /// Delete a key by tombstoning its live insertion.
    ///
    /// Returns an empty update if the key is not present.
    pub fn delete(&mut self, key: &K) -> Update<K, V> {
        let Some((id, previous)) = self.pairs.remove(key) else {
            return Update::empty();
        };
        self.tombstones.insert(
            key.clone(),
            Tombstone {
                id,
                at: Instant::now(),
            },
        );
        self.mutations += 1;

        let mut queue = Queue::new();
        queue.deletions.push((key.clone(), id));
        Update {
            queue,
            change: Some(Change::Delete {
                key: key.clone(),
                id,
                previous,
            }),
        }
    }

    /// Merge a remote queue.
    ///
    /// Already-applied and superseded operations are skipped without
    /// producing changes, so replaying a queue is a no-op.
    pub fn process(&mut self, queue: Queue<K, V>) -> Vec<Change<K, V>> {
        let mut changes = Vec::new();

        for (key, id, value) in queue.insertions {
            self.observe(id);
            if self.floor(&key).is_some_and(|floor| floor >= id) {
                continue;
            }
            let previous = self
                .pairs
                .insert(key.clone(), (id, value.clone()))
                .map(|(_, v)| v);
            self.tombstones.remove(&key);
            changes.push(Change::Set {
                key,
                id,
                value,
                previous,
            });
        }

        for (key, id) in queue.deletions {
            self.observe(id);
            if self.tombstones.get(&key).is_some_and(|t| t.id >= id) {
                continue;
            }
            if let Some((live, _)) = self.pairs.get(&key) {
                if *live > id {
                    continue;
                }
                if let Some((live, previous)) = self.pairs.remove(&key) {
                    changes.push(Change::Delete {
                        key: key.clone(),
                        id: live,
                        previous,
                    });
                }
            }
            self.tombstones.insert(
                key,
                Tombstone {
                    id,
                    at: Instant::now(),
                },
            );
        }

        changes
    }

    /// Full state as a queue, for bootstrapping another replica.
    #[must_use]
    pub fn dump(&self) -> Queue<K, V> {
        Queue {
            insertions: self
                .pairs
                .iter()
                .map(|(key, (id, value))| (key.clone(), *id, value.clone()))
                .collect(),
            deletions: self
                .tombstones
                .iter()
                .map(|(key, tombstone)| (key.clone(), tombstone.id))
                .collect(),
        }
    }

    /// Discard tombstones older than the retention window.
    ///
    /// Returns the number of tombstones removed.
    pub fn flush(&mut self) -> usize {
        let now = Instant::now();
        let max_age = self.max_age;
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| now.saturating_duration_since(t.at) < max_age);
        before - self.tombstones.len()
    }

    /// Get the value of a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.pairs.get(key).map(|(_, v)| v)
    }

    /// Get the live insertion id of a key.
    #[must_use]
    pub fn id_of(&self, key: &K) -> Option<OpId> {
        self.pairs.get(key).map(|(id, _)| *id)
    }

    /// Check if a key is present.
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.pairs.contains_key(key)
    }

    /// Iterate over live keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.pairs.keys()
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.pairs.iter().map(|(k, (_, v))| (k, v))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the map has no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of retained tombstones.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Number of local `set`/`delete` operations that changed state.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations
    }

    /// Replica id stamped on local insertions.
    #[must_use]
    pub fn replica(&self) -> u64 {
        self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Map = ObservedRemoveMap<String, u32>;

    fn k(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_set_get_delete() {
        let mut map = Map::new(1);
        let update = map.set(k("a"), 1);
        assert_eq!(update.queue.insertions.len(), 1);
        assert_eq!(map.get(&k("a")), Some(&1));

        let update = map.set(k("a"), 2);
        assert!(matches!(
            update.change,
            Some(Change::Set {
                previous: Some(1),
                ..
            })
        ));

        let update = map.delete(&k("a"));
        assert_eq!(update.queue.deletions.len(), 1);
        assert!(!map.has(&k("a")));
        assert_eq!(map.mutation_count(), 3);

        assert!(map.delete(&k("a")).is_empty());
    }

    #[test]
    fn test_process_is_idempotent() {
        let mut source = Map::new(1);
        let mut queue = source.set(k("a"), 1).queue;
        queue.extend(source.set(k("b"), 2).queue);
        queue.extend(source.delete(&k("b")).queue);

        let mut replica = Map::new(2);
        let changes = replica.process(queue.clone());
        assert_eq!(changes.len(), 3);
        assert!(replica.process(queue).is_empty());
        assert_eq!(replica.get(&k("a")), Some(&1));
        assert!(!replica.has(&k("b")));
    }

    #[test]
    fn test_deletion_before_insertion() {
        let mut source = Map::new(1);
        let insert = source.set(k("a"), 1).queue;
        let delete = source.delete(&k("a")).queue;

        let mut replica = Map::new(2);
        assert!(replica.process(delete).is_empty());
        assert!(replica.process(insert).is_empty());
        assert!(!replica.has(&k("a")));
    }

    #[test]
    fn test_stale_insertion_after_delete_of_newer() {
        let mut source = Map::new(1);
        let first = source.set(k("a"), 1).queue;
        let second = source.set(k("a"), 2).queue;
        let delete = source.delete(&k("a")).queue;

        let mut replica = Map::new(2);
        replica.process(second);
        replica.process(delete);
        assert!(replica.process(first).is_empty());
        assert!(!replica.has(&k("a")));
    }

    #[test]
    fn test_delete_of_unseen_newer_insertion_removes_older() {
        let mut source = Map::new(1);
        let first = source.set(k("a"), 1).queue;
        source.set(k("a"), 2);
        let delete = source.delete(&k("a")).queue;

        let mut replica = Map::new(2);
        replica.process(first);
        let changes = replica.process(delete);
        assert!(matches!(changes.as_slice(), [Change::Delete { .. }]));
        assert!(!replica.has(&k("a")));
    }

    #[test]
    fn test_concurrent_set_tie_break() {
        let queue_low = Queue {
            insertions: vec![(k("a"), OpId::new(10, 1), 1)],
            deletions: vec![],
        };
        let queue_high = Queue {
            insertions: vec![(k("a"), OpId::new(10, 2), 2)],
            deletions: vec![],
        };

        let mut left = Map::new(3);
        left.process(queue_low.clone());
        left.process(queue_high.clone());

        let mut right = Map::new(4);
        right.process(queue_high);
        right.process(queue_low);

        assert_eq!(left.get(&k("a")), Some(&2));
        assert_eq!(right.get(&k("a")), Some(&2));
    }

    #[test]
    fn test_add_wins_over_concurrent_remove() {
        let mut left = Map::new(1);
        let mut right = Map::new(2);
        let initial = left.set(k("a"), 1).queue;
        right.process(initial);

        let removal = left.delete(&k("a")).queue;
        let re_add = right.set(k("a"), 5).queue;

        left.process(re_add);
        right.process(removal);
        assert_eq!(left.get(&k("a")), Some(&5));
        assert_eq!(right.get(&k("a")), Some(&5));
    }

    #[test]
    fn test_local_clock_follows_remote() {
        let far_future = OpId::new(u64::MAX / 2, 9);
        let mut map = Map::new(1);
        map.process(Queue {
            insertions: vec![(k("a"), far_future, 1)],
            deletions: vec![],
        });
        map.set(k("a"), 2);
        assert_eq!(map.get(&k("a")), Some(&2));
        assert!(map.id_of(&k("a")).unwrap() > far_future);
    }

    #[test]
    fn test_dump_restores_state() {
        let mut source = Map::new(1);
        source.set(k("a"), 1);
        source.set(k("b"), 2);
        source.delete(&k("b"));

        let mut replica = Map::new(2);
        replica.process(source.dump());
        assert_eq!(replica.get(&k("a")), Some(&1));
        assert!(!replica.has(&k("b")));
        assert_eq!(replica.len(), source.len());
        assert_eq!(replica.tombstone_count(), 1);
    }

    #[test]
    fn test_flush_discards_old_tombstones() {
        let mut map = Map::with_max_age(1, Duration::ZERO);
        map.set(k("a"), 1);
        map.delete(&k("a"));
        assert_eq!(map.tombstone_count(), 1);
        assert_eq!(map.flush(), 1);
        assert_eq!(map.tombstone_count(), 0);

        let mut kept = Map::new(1);
        kept.set(k("a"), 1);
        kept.delete(&k("a"));
        assert_eq!(kept.flush(), 0);
    }
}
