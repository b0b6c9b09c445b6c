//! Key subscriptions and named events.
//!
//! A socket subscribed to a key receives the current value right away and
//! every change after that. The first local subscriber of a key marks
//! `(self, key)` in `peer_subscriptions`; the last one leaving removes it.
//!
//! Named events are flooded like dumps and deduplicated by their random id.

use braid_protocol::dump::DataQueue;
use braid_protocol::{Message, PeerId, SocketId};
use serde_json::Value;
use tracing::{debug, trace};

use super::state::State;
use crate::metrics;

impl State {
    /// Subscribe a socket to a key.
    pub(crate) fn add_subscription(&mut self, socket_id: SocketId, key: String) {
        if !self.sockets.contains_key(&socket_id) {
            return;
        }
        if self.subscriptions.add_edge(socket_id, key.clone()) {
            debug!(socket = %socket_id, key = %key, "Subscribed");
            metrics::record_subscription();
        }
        let marker = (self.id, key.clone());
        if !self.peer_subscriptions.has(&marker) {
            let update = self.peer_subscriptions.add(marker);
            self.publish_peer_subscriptions(update.queue);
        }
        self.expiring_keys.cancel(&key);

        if let (Some(value), Some(id)) = (self.data.get(&key), self.data.id_of(&key)) {
            let mut queue = DataQueue::new();
            queue.insertions.push((key.clone(), id, value.clone()));
            self.send_to_socket(socket_id, &Message::data_dump(queue, Vec::new()));
        }
        self.assign_provider(&key);
    }

    /// Unsubscribe a socket from a key.
    pub(crate) fn remove_subscription(&mut self, socket_id: SocketId, key: &str) {
        let key = key.to_string();
        if !self.subscriptions.remove_edge(&socket_id, &key) {
            return;
        }
        debug!(socket = %socket_id, key = %key, "Unsubscribed");
        self.local_subscribers_changed(&key);
    }

    /// Drop every subscription of a closed socket.
    pub(crate) fn remove_socket_subscriptions(&mut self, socket_id: SocketId) {
        for key in self.subscriptions.remove_source(&socket_id) {
            self.local_subscribers_changed(&key);
        }
        self.event_subscriptions.remove_source(&socket_id);
    }

    fn local_subscribers_changed(&mut self, key: &str) {
        let owned_key = key.to_string();
        if self.subscriptions.has_target(&owned_key) {
            return;
        }
        let update = self.peer_subscriptions.delete(&(self.id, owned_key));
        self.publish_peer_subscriptions(update.queue);
        self.subscribers_changed(key);
    }

    pub(crate) fn add_event_subscription(&mut self, socket_id: SocketId, name: String) {
        if !self.sockets.contains_key(&socket_id) {
            return;
        }
        if self.event_subscriptions.add_edge(socket_id, name.clone()) {
            debug!(socket = %socket_id, name = %name, "Subscribed to event");
        }
    }

    pub(crate) fn remove_event_subscription(&mut self, socket_id: SocketId, name: &str) {
        self.event_subscriptions
            .remove_edge(&socket_id, &name.to_string());
    }

    fn deliver_event(&self, name: &str, args: &[Value], id: u64) {
        let message = Message::BraidEvent {
            name: name.to_string(),
            args: args.to_vec(),
            id,
            ids: Vec::new(),
        };
        for socket_id in self.event_subscriptions.get_sources(&name.to_string()) {
            self.send_to_socket(*socket_id, &message);
        }
    }

    /// Send a named event to every subscribed socket in the mesh.
    pub(crate) fn emit_to_clients(&mut self, name: &str, args: Vec<Value>) {
        let id = rand::random::<u64>();
        self.recent.insert(id);
        self.deliver_event(name, &args, id);
        let name = name.to_string();
        self.flood(&[], |ids| Message::BraidEvent { name, args, id, ids });
    }

    /// Send a named event to one socket, wherever it is connected.
    pub(crate) fn emit_to_socket(&mut self, name: &str, socket_id: SocketId, args: Vec<Value>) {
        let id = rand::random::<u64>();
        if self.deliver_socket_event(name, socket_id, &args, id) {
            return;
        }
        self.recent.insert(id);
        let name = name.to_string();
        self.flood(&[], |ids| Message::BraidSocketEvent {
            name,
            socket_id,
            args,
            id,
            ids,
        });
    }

    fn deliver_socket_event(&self, name: &str, socket_id: SocketId, args: &[Value], id: u64) -> bool {
        if !self.sockets.contains_key(&socket_id) || self.peer_sockets.has_source(&socket_id) {
            return false;
        }
        self.send_to_socket(
            socket_id,
            &Message::BraidEvent {
                name: name.to_string(),
                args: args.to_vec(),
                id,
                ids: Vec::new(),
            },
        );
        true
    }

    pub(crate) fn handle_braid_event(&mut self, name: String, args: Vec<Value>, id: u64, ids: Vec<PeerId>) {
        if !self.recent.insert(id) {
            metrics::record_dedup_drop();
            trace!(name = %name, id, "Duplicate event");
            return;
        }
        self.deliver_event(&name, &args, id);
        self.flood(&ids, |ids| Message::BraidEvent { name, args, id, ids });
    }

    pub(crate) fn handle_braid_socket_event(
        &mut self,
        name: String,
        socket_id: SocketId,
        args: Vec<Value>,
        id: u64,
        ids: Vec<PeerId>,
    ) {
        if !self.recent.insert(id) {
            metrics::record_dedup_drop();
            trace!(name = %name, id, "Duplicate socket event");
            return;
        }
        if self.deliver_socket_event(&name, socket_id, &args, id) {
            return;
        }
        self.flood(&ids, |ids| Message::BraidSocketEvent {
            name,
            socket_id,
            args,
            id,
            ids,
        });
    }
}
