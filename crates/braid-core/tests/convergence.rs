//! Replicas receiving the same operations in any order, with duplicates,
//! end up with identical visible state.

use braid_core::{ObservedRemoveMap, ObservedRemoveSet};
use braid_protocol::Queue;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
enum Op {
    Set(usize, u8, u32),
    Delete(usize, u8),
    Relay(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..3usize, 0..4u8, any::<u32>()).prop_map(|(r, k, v)| Op::Set(r, k, v)),
        2 => (0..3usize, 0..4u8).prop_map(|(r, k)| Op::Delete(r, k)),
        1 => (0..3usize, 0..3usize).prop_map(|(from, to)| Op::Relay(from, to)),
    ]
}

type Map = ObservedRemoveMap<String, u32>;

/// Run operations on three source replicas, occasionally syncing them, and
/// collect every emitted queue.
fn generate(ops: &[Op]) -> Vec<Queue<String, u32>> {
    let mut sources: Vec<Map> = (0..3).map(|r| Map::new(r as u64 + 1)).collect();
    let mut emitted = Vec::new();

    for op in ops {
        match op {
            Op::Set(r, k, v) => {
                let update = sources[*r].set(format!("k{k}"), *v);
                emitted.push(update.queue);
            }
            Op::Delete(r, k) => {
                let update = sources[*r].delete(&format!("k{k}"));
                if !update.is_empty() {
                    emitted.push(update.queue);
                }
            }
            Op::Relay(from, to) if from != to => {
                let dump = sources[*from].dump();
                sources[*to].process(dump);
            }
            Op::Relay(..) => {}
        }
    }
    emitted
}

fn visible(map: &Map) -> BTreeMap<String, u32> {
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

proptest! {
    #[test]
    fn prop_map_converges(
        ops in prop::collection::vec(op(), 1..40),
        order in any::<prop::sample::Index>(),
        duplicates in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let queues = generate(&ops);
        prop_assume!(!queues.is_empty());

        let mut in_order = Map::new(10);
        for queue in &queues {
            in_order.process(queue.clone());
        }

        let mut shuffled: Vec<Queue<String, u32>> = queues.clone();
        let pivot = order.index(shuffled.len());
        shuffled.rotate_left(pivot);
        shuffled.reverse();
        for dup in &duplicates {
            shuffled.push(queues[dup.index(queues.len())].clone());
        }

        let mut out_of_order = Map::new(11);
        for queue in shuffled {
            out_of_order.process(queue);
        }

        prop_assert_eq!(visible(&in_order), visible(&out_of_order));

        let replay: Vec<_> = queues.iter().flat_map(|q| in_order.process(q.clone())).collect();
        prop_assert!(replay.is_empty());
    }

    #[test]
    fn prop_dump_restore_matches(ops in prop::collection::vec(op(), 1..40)) {
        let mut source = Map::new(1);
        for queue in generate(&ops) {
            source.process(queue);
        }
        let mut restored = Map::new(2);
        restored.process(source.dump());
        prop_assert_eq!(visible(&source), visible(&restored));
    }

    #[test]
    fn prop_set_converges(values in prop::collection::vec((0..2usize, 0..6u8, any::<bool>()), 1..30)) {
        let mut sources = [ObservedRemoveSet::new(1), ObservedRemoveSet::new(2)];
        let mut queues = Vec::new();
        for (replica, value, add) in values {
            let update = if add {
                sources[replica].add(value)
            } else {
                sources[replica].delete(&value)
            };
            if !update.is_empty() {
                queues.push(update.queue);
            }
        }

        let mut forward = ObservedRemoveSet::new(3);
        for queue in &queues {
            forward.process(queue.clone());
        }
        let mut backward = ObservedRemoveSet::new(4);
        for queue in queues.iter().rev() {
            backward.process(queue.clone());
        }

        let forward: BTreeSet<u8> = forward.values().copied().collect();
        let backward: BTreeSet<u8> = backward.values().copied().collect();
        prop_assert_eq!(forward, backward);
    }
}
