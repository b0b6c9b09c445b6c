//! Merging and forwarding of replicated state.
//!
//! Every dump is merged into its map, then forwarded to the direct peers
//! missing from its id list the first time its content is seen. Local
//! mutations are flooded the same way with an empty seen list.

use braid_core::crdt::{Change, SetChange, Update};
use braid_protocol::dump::{
    ActiveProviderQueue, CustomMapQueue, CustomSetQueue, DataQueue, PatternQueue, PeerQueue,
    PeerSubscriptionQueue,
};
use braid_protocol::{Message, MessageType, PeerId, SetValue};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, trace};

use super::state::{changes_to_queue, State};
use crate::events::ServerEvent;

impl State {
    /// Route a replication dump received from a peer.
    pub(crate) fn handle_dump(&mut self, message: Message) {
        match message {
            Message::DataDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::DataDump, &queue);
                self.merge_data(queue.clone());
                if forward {
                    self.flood(&ids, |ids| Message::DataDump { queue, ids });
                }
            }
            Message::PeerDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::PeerDump, &queue);
                if forward {
                    let queue = queue.clone();
                    self.flood(&ids, |ids| Message::PeerDump { queue, ids });
                }
                self.merge_peers(queue);
            }
            Message::ProviderDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::ProviderDump, &queue);
                if forward {
                    let queue = queue.clone();
                    self.flood(&ids, |ids| Message::ProviderDump { queue, ids });
                }
                self.merge_providers(queue);
            }
            Message::ReceiverDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::ReceiverDump, &queue);
                if forward {
                    let queue = queue.clone();
                    self.flood(&ids, |ids| Message::ReceiverDump { queue, ids });
                }
                self.merge_receivers(queue);
            }
            Message::ActiveProviderDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::ActiveProviderDump, &queue);
                if forward {
                    let queue = queue.clone();
                    self.flood(&ids, |ids| Message::ActiveProviderDump { queue, ids });
                }
                self.merge_active_providers(queue);
            }
            Message::PeerSubscriptionDump { queue, ids } => {
                let forward = self.first_sighting(MessageType::PeerSubscriptionDump, &queue);
                if forward {
                    let queue = queue.clone();
                    self.flood(&ids, |ids| Message::PeerSubscriptionDump { queue, ids });
                }
                self.merge_peer_subscriptions(queue);
            }
            Message::CustomMapDump { name, queue, ids } => {
                let forward = self.first_sighting(MessageType::CustomMapDump, &(&name, &queue));
                if forward {
                    let (name, queue) = (name.clone(), queue.clone());
                    self.flood(&ids, |ids| Message::CustomMapDump { name, queue, ids });
                }
                self.merge_custom_map(&name, queue);
            }
            Message::CustomSetDump { name, queue, ids } => {
                let forward = self.first_sighting(MessageType::CustomSetDump, &(&name, &queue));
                if forward {
                    let (name, queue) = (name.clone(), queue.clone());
                    self.flood(&ids, |ids| Message::CustomSetDump { name, queue, ids });
                }
                self.merge_custom_set(&name, queue);
            }
            other => debug!(message_type = %other.message_type(), "Not a dump"),
        }
    }

    pub(crate) fn merge_data(&mut self, queue: DataQueue) -> DataQueue {
        let changes = self.data.process(queue);
        let merged = changes_to_queue(&changes);
        self.data_changed(changes);
        merged
    }

    pub(crate) fn merge_peers(&mut self, queue: PeerQueue) -> PeerQueue {
        let changes = self.peers.process(queue);
        if changes.is_empty() {
            return PeerQueue::new();
        }
        let merged = changes_to_queue(&changes);
        if changes.iter().any(|change| *change.key() == self.id) {
            self.update_own_peers();
        }
        self.prune();
        merged
    }

    pub(crate) fn merge_providers(&mut self, queue: PatternQueue) -> PatternQueue {
        let changes = self.providers.process(queue);
        if changes.is_empty() {
            return PatternQueue::new();
        }
        let merged = changes_to_queue(&changes);
        if changes.iter().any(|change| *change.key() == self.id) {
            self.publish_own_providers();
        }
        self.assign_all();
        merged
    }

    pub(crate) fn merge_receivers(&mut self, queue: PatternQueue) -> PatternQueue {
        let changes = self.receivers.process(queue);
        if changes.is_empty() {
            return PatternQueue::new();
        }
        let merged = changes_to_queue(&changes);
        if changes.iter().any(|change| *change.key() == self.id) {
            self.publish_own_receivers();
        }
        self.reassign_publications();
        merged
    }

    pub(crate) fn merge_active_providers(&mut self, queue: ActiveProviderQueue) -> ActiveProviderQueue {
        let changes = self.active_providers.process(queue);
        let merged = changes_to_queue(&changes);
        let keys: HashSet<String> = changes.into_iter().map(|c| c.key().clone()).collect();
        for key in keys {
            self.sync_local_provider(&key);
        }
        merged
    }

    pub(crate) fn merge_peer_subscriptions(
        &mut self,
        queue: PeerSubscriptionQueue,
    ) -> PeerSubscriptionQueue {
        let changes = self.peer_subscriptions.process(queue.clone());
        if changes.is_empty() {
            return PeerSubscriptionQueue::new();
        }

        // Only the applied operations travel on.
        let applied: HashSet<&(PeerId, String)> = changes
            .iter()
            .map(|change| match change {
                SetChange::Add(value) | SetChange::Delete(value) => value,
            })
            .collect();
        let mut merged = PeerSubscriptionQueue::new();
        merged.insertions = queue
            .insertions
            .iter()
            .filter(|(value, _, _)| applied.contains(value))
            .cloned()
            .collect();
        merged.deletions = queue
            .deletions
            .iter()
            .filter(|(value, _)| applied.contains(value))
            .cloned()
            .collect();

        let mut keys = HashSet::new();
        let mut heal = Vec::new();
        for change in changes {
            match change {
                SetChange::Add((_, key)) => {
                    keys.insert(key);
                }
                SetChange::Delete((peer, key)) => {
                    if peer == self.id && self.subscriptions.has_target(&key) {
                        heal.push(key.clone());
                    }
                    keys.insert(key);
                }
            }
        }
        for key in heal {
            debug!(key = %key, "Re-asserting own subscription");
            let update = self.peer_subscriptions.add((self.id, key));
            self.publish_peer_subscriptions(update.queue);
        }
        for key in keys {
            self.subscribers_changed(&key);
        }
        merged
    }

    pub(crate) fn merge_custom_map(&mut self, name: &str, queue: CustomMapQueue) -> CustomMapQueue {
        let changes = self.custom_map(name).process(queue);
        let merged = changes_to_queue(&changes);
        for change in changes {
            self.emit_custom_map_change(name, change);
        }
        merged
    }

    pub(crate) fn merge_custom_set(&mut self, name: &str, queue: CustomSetQueue) -> CustomSetQueue {
        let changes = self.custom_set(name).process(queue.clone());
        let applied: HashSet<SetValue> = changes
            .iter()
            .map(|change| match change {
                SetChange::Add(value) | SetChange::Delete(value) => value.clone(),
            })
            .collect();
        let mut merged = CustomSetQueue::new();
        merged.insertions = queue
            .insertions
            .into_iter()
            .filter(|(value, _, _)| applied.contains(value))
            .collect();
        merged.deletions = queue
            .deletions
            .into_iter()
            .filter(|(value, _)| applied.contains(value))
            .collect();
        for change in changes {
            self.emit_custom_set_change(name, change);
        }
        merged
    }

    /// Fan data changes out to local subscribers and listeners.
    pub(crate) fn data_changed(&mut self, changes: Vec<Change<String, Value>>) {
        if changes.is_empty() {
            return;
        }
        let mut per_socket: std::collections::HashMap<_, DataQueue> =
            std::collections::HashMap::new();
        for change in &changes {
            let key = change.key();
            let sockets: Vec<_> = self.subscriptions.get_sources(key).copied().collect();
            for socket_id in sockets {
                let queue = per_socket.entry(socket_id).or_default();
                match change {
                    Change::Set { key, id, value, .. } => {
                        queue.insertions.push((key.clone(), *id, value.clone()));
                    }
                    Change::Delete { key, id, .. } => queue.deletions.push((key.clone(), *id)),
                }
            }
        }
        for (socket_id, queue) in per_socket {
            trace!(socket = %socket_id, count = queue.len(), "Fan-out");
            self.send_to_socket(socket_id, &Message::data_dump(queue, Vec::new()));
        }
        for change in changes {
            let event = match change {
                Change::Set { key, value, .. } => ServerEvent::DataChange {
                    key,
                    value: Some(value),
                },
                Change::Delete { key, .. } => ServerEvent::DataChange { key, value: None },
            };
            self.emit(event);
        }
    }

    /// Replicate and fan out a local data mutation.
    pub(crate) fn apply_local_data(&mut self, update: Update<String, Value>) {
        let queue = update.queue;
        self.first_sighting(MessageType::DataDump, &queue);
        let key = update.change.as_ref().map(|change| change.key().clone());
        let changes: Vec<_> = update.change.into_iter().collect();
        self.data_changed(changes);
        self.flood(&[], |ids| Message::DataDump { queue, ids });

        if let Some(key) = key {
            if self.data.has(&key) && !self.has_global_subscribers(&key) {
                self.schedule_key_expiry(&key);
            }
        }
    }

    pub(crate) fn publish_peers(&mut self, queue: PeerQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::PeerDump, &queue);
        self.flood(&[], |ids| Message::PeerDump { queue, ids });
    }

    pub(crate) fn publish_providers(&mut self, queue: PatternQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::ProviderDump, &queue);
        self.flood(&[], |ids| Message::ProviderDump { queue, ids });
    }

    pub(crate) fn publish_receivers(&mut self, queue: PatternQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::ReceiverDump, &queue);
        self.flood(&[], |ids| Message::ReceiverDump { queue, ids });
    }

    pub(crate) fn publish_active_providers(&mut self, queue: ActiveProviderQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::ActiveProviderDump, &queue);
        self.flood(&[], |ids| Message::ActiveProviderDump { queue, ids });
    }

    pub(crate) fn publish_peer_subscriptions(&mut self, queue: PeerSubscriptionQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::PeerSubscriptionDump, &queue);
        self.flood(&[], |ids| Message::PeerSubscriptionDump { queue, ids });
    }

    pub(crate) fn publish_custom_map(&mut self, name: &str, queue: CustomMapQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::CustomMapDump, &(name, &queue));
        let name = name.to_string();
        self.flood(&[], |ids| Message::CustomMapDump { name, queue, ids });
    }

    pub(crate) fn publish_custom_set(&mut self, name: &str, queue: CustomSetQueue) {
        if queue.is_empty() {
            return;
        }
        self.first_sighting(MessageType::CustomSetDump, &(name, &queue));
        let name = name.to_string();
        self.flood(&[], |ids| Message::CustomSetDump { name, queue, ids });
    }

    /// Write `peers[self]` unless it already lists exactly the direct peers.
    pub(crate) fn update_own_peers(&mut self) {
        let direct: Vec<PeerId> = self.direct_peers().into_iter().collect();
        if self.peers.get(&self.id) == Some(&direct) {
            return;
        }
        let update = self.peers.set(self.id, direct);
        self.publish_peers(update.queue);
    }
}
