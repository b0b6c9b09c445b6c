//! Socket boundary and message dispatch.
//!
//! Credentials submitted by one socket are checked one at a time by a
//! per-socket worker. Peer, subscribe, event subscribe and publish requests
//! wait until that queue is idle, run their handler without the state lock
//! and re-check that the socket still exists before acting.

use braid_protocol::{codec, version, Message, Outcome, PeerId, SocketId};
use braid_transport::SocketHandle;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::state::{send, Origin, SocketEntry, State};
use super::{CredentialGate, Inner};
use crate::auth::{
    self, CredentialsRequest, EventSubscribeRequest, PeerRequest, PublishRequest, SubscribeRequest,
};
use crate::metrics;

impl Inner {
    pub(crate) fn add_socket(self: &Arc<Self>, handle: SocketHandle) {
        let socket_id = handle.id();
        if self.is_closing() {
            handle.close(braid_transport::codes::GOING_AWAY, "Server closing");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let (pending, _) = watch::channel(0usize);
        self.credential_gates
            .insert(socket_id, CredentialGate { tx, pending });
        {
            let mut state = self.state.lock();
            state.sockets.insert(
                socket_id,
                SocketEntry {
                    handle,
                    credentials: None,
                },
            );
            self.socket_count.send_replace(state.sockets.len());
        }
        debug!(socket = %socket_id, "Socket added");

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(credentials) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.process_credentials(socket_id, credentials).await;
            }
        });
    }

    pub(crate) fn remove_socket(&self, socket_id: SocketId) {
        self.credential_gates.remove(&socket_id);
        let mut state = self.state.lock();
        if state.sockets.remove(&socket_id).is_none() {
            return;
        }
        self.socket_count.send_replace(state.sockets.len());
        state.multipart.remove(&Origin::Socket(socket_id));
        debug!(socket = %socket_id, "Socket removed");

        state.remove_socket_subscriptions(socket_id);
        state.publications.remove_source(&socket_id);
        state.unassign_socket(socket_id);
        for peer in state.peer_sockets.remove_source(&socket_id) {
            state.remove_peer(peer);
        }
    }

    /// Decode and dispatch one inbound frame.
    pub(crate) fn handle_frame(self: &Arc<Self>, origin: Origin, data: Bytes) {
        metrics::record_message(data.len(), "inbound");
        self.process_frame(origin, &data);
    }

    fn process_frame(self: &Arc<Self>, origin: Origin, data: &[u8]) {
        let message = match codec::decode(data) {
            Ok(message) => message,
            Err(e) if e.is_outdated_client() => {
                self.reply_outdated(origin);
                return;
            }
            Err(e) => {
                warn!(origin = ?origin, error = %e, "Dropping undecodable frame");
                metrics::record_error("decode");
                return;
            }
        };

        if let Message::MultipartContainer {
            id,
            position,
            length,
            data,
        } = message
        {
            let assembled = self
                .state
                .lock()
                .push_multipart(origin, id, position, length, data);
            match assembled {
                Ok(Some(frame)) => self.process_frame(origin, &frame),
                Ok(None) => trace!(id, position, length, "Multipart chunk"),
                Err(e) => warn!(origin = ?origin, error = %e, "Dropping multipart chunk"),
            }
            return;
        }
        self.dispatch(origin, message);
    }

    fn reply_outdated(&self, origin: Origin) {
        let Origin::Socket(socket_id) = origin else {
            warn!(origin = ?origin, "Outdated frame on peer link");
            return;
        };
        let Some(handle) = self
            .state
            .lock()
            .sockets
            .get(&socket_id)
            .map(|entry| entry.handle.clone())
        else {
            return;
        };
        info!(socket = %socket_id, "Outdated client, requesting reload");
        match version::legacy_reload_frames() {
            Ok(frames) => {
                for frame in frames {
                    if let Err(e) = handle.send_raw(frame) {
                        debug!(socket = %socket_id, error = %e, "Reload frame not sent");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to build reload frames"),
        }
    }

    fn dispatch(self: &Arc<Self>, origin: Origin, message: Message) {
        trace!(origin = ?origin, message_type = %message.message_type(), "Dispatch");
        if message.is_peer_only() {
            let mut state = self.state.lock();
            let Some(peer) = state.peer_of(origin) else {
                warn!(origin = ?origin, message_type = %message.message_type(), "Peer message from non-peer socket");
                metrics::record_error("protocol");
                return;
            };
            state.handle_peer_message(peer, message);
            return;
        }

        let Origin::Socket(socket_id) = origin else {
            debug!(origin = ?origin, message_type = %message.message_type(), "Ignoring client message on peer link");
            return;
        };
        match message {
            Message::Credentials { value } => self.queue_credentials(socket_id, value),
            Message::PeerRequest { id } => {
                tokio::spawn(Arc::clone(self).peer_request(socket_id, id));
            }
            Message::SubscribeRequest { key } => {
                tokio::spawn(Arc::clone(self).subscribe_request(socket_id, key));
            }
            Message::Unsubscribe { key } => self.state.lock().remove_subscription(socket_id, &key),
            Message::EventSubscribeRequest { name } => {
                tokio::spawn(Arc::clone(self).event_subscribe_request(socket_id, name));
            }
            Message::EventUnsubscribe { name } => {
                self.state.lock().remove_event_subscription(socket_id, &name);
            }
            Message::PublishRequest { key } => {
                tokio::spawn(Arc::clone(self).publish_request(socket_id, key));
            }
            Message::Unpublish { key } => {
                let mut state = self.state.lock();
                if state.publications.remove_edge(&socket_id, &key) {
                    state.unassign_receiver(&key, socket_id);
                }
            }
            Message::PublisherMessage { key, message } => {
                self.state
                    .lock()
                    .handle_publisher_message(socket_id, key, message);
            }
            other => {
                debug!(socket = %socket_id, message_type = %other.message_type(), "Unexpected client message");
            }
        }
    }

    fn queue_credentials(&self, socket_id: SocketId, credentials: Value) {
        let Some(gate) = self.credential_gates.get(&socket_id) else {
            return;
        };
        gate.pending.send_modify(|n| *n += 1);
        if gate.tx.send(credentials).is_err() {
            gate.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    async fn process_credentials(&self, socket_id: SocketId, credentials: Value) {
        let ip = self
            .state
            .lock()
            .sockets
            .get(&socket_id)
            .map(|entry| entry.handle.remote_addr());
        if let Some(ip) = ip {
            let handler = self.handlers.read().credentials.clone();
            let request = CredentialsRequest {
                socket_id,
                ip,
                credentials: credentials.clone(),
            };
            let outcome = auth::run(handler, request, "Credentials").await;

            let mut state = self.state.lock();
            if let Some(entry) = state.sockets.get_mut(&socket_id) {
                if outcome.success {
                    entry.credentials = Some(credentials);
                } else {
                    debug!(socket = %socket_id, code = outcome.code, "Credentials rejected");
                }
                send(&entry.handle, &Message::CredentialsResponse { outcome });
            }
        }
        if let Some(gate) = self.credential_gates.get(&socket_id) {
            gate.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Wait until no credentials check is queued for the socket, then return
    /// its accepted credentials. `None` if the socket is gone.
    async fn settled_credentials(&self, socket_id: SocketId) -> Option<Option<Value>> {
        let pending = self
            .credential_gates
            .get(&socket_id)
            .map(|gate| gate.pending.subscribe());
        if let Some(mut pending) = pending {
            let _ = pending.wait_for(|n| *n == 0).await;
        }
        self.state
            .lock()
            .sockets
            .get(&socket_id)
            .map(|entry| entry.credentials.clone())
    }

    async fn peer_request(self: Arc<Self>, socket_id: SocketId, peer: PeerId) {
        let Some(credentials) = self.settled_credentials(socket_id).await else {
            return;
        };
        let handler = self.handlers.read().peer.clone();
        let request = PeerRequest {
            socket_id,
            peer_id: peer,
            credentials,
        };
        let outcome = auth::run(handler, request, "Peer").await;

        let mut state = self.state.lock();
        let Some(handle) = state.sockets.get(&socket_id).map(|entry| entry.handle.clone()) else {
            return;
        };
        let respond = |outcome: Outcome| {
            send(
                &handle,
                &Message::PeerResponse {
                    id: self.id,
                    outcome,
                },
            )
        };
        if !outcome.success {
            respond(outcome);
            return;
        }
        if peer == self.id {
            respond(Outcome::failed(400, "Cannot link to self"));
            return;
        }
        if state.peer_connections.contains_key(&peer) {
            respond(Outcome::failed(
                braid_transport::codes::DUPLICATE_PEER_LINK,
                "Already linked to peer",
            ));
            return;
        }
        if state.peer_sockets.has_target(&peer) {
            respond(Outcome::failed(
                braid_transport::codes::DUPLICATE_PEER_SOCKET,
                "Peer already has a socket",
            ));
            return;
        }

        state.peer_sockets.add_edge(socket_id, peer);
        respond(Outcome::ok());
        state.link_established(peer);
    }

    async fn subscribe_request(self: Arc<Self>, socket_id: SocketId, key: String) {
        let Some(credentials) = self.settled_credentials(socket_id).await else {
            return;
        };
        let handler = self.handlers.read().subscribe.clone();
        let request = SubscribeRequest {
            socket_id,
            key: key.clone(),
            credentials,
        };
        let outcome = auth::run(handler, request, "Subscribe").await;

        let mut state = self.state.lock();
        if !state.sockets.contains_key(&socket_id) {
            return;
        }
        let success = outcome.success;
        state.send_to_socket(
            socket_id,
            &Message::SubscribeResponse {
                key: key.clone(),
                outcome,
            },
        );
        if success {
            state.add_subscription(socket_id, key);
        }
    }

    async fn event_subscribe_request(self: Arc<Self>, socket_id: SocketId, name: String) {
        let Some(credentials) = self.settled_credentials(socket_id).await else {
            return;
        };
        let handler = self.handlers.read().event_subscribe.clone();
        let request = EventSubscribeRequest {
            socket_id,
            name: name.clone(),
            credentials,
        };
        let outcome = auth::run(handler, request, "Event subscribe").await;

        let mut state = self.state.lock();
        if !state.sockets.contains_key(&socket_id) {
            return;
        }
        let success = outcome.success;
        state.send_to_socket(
            socket_id,
            &Message::EventSubscribeResponse {
                name: name.clone(),
                outcome,
            },
        );
        if success {
            state.add_event_subscription(socket_id, name);
        }
    }

    async fn publish_request(self: Arc<Self>, socket_id: SocketId, key: String) {
        let Some(credentials) = self.settled_credentials(socket_id).await else {
            return;
        };
        let handler = self.handlers.read().publish.clone();
        let request = PublishRequest {
            socket_id,
            key: key.clone(),
            credentials,
        };
        let outcome = auth::run(handler, request, "Publish").await;

        let mut state = self.state.lock();
        if !state.sockets.contains_key(&socket_id) {
            return;
        }
        let success = outcome.success;
        state.send_to_socket(
            socket_id,
            &Message::PublishResponse {
                key: key.clone(),
                outcome,
            },
        );
        if success && state.publications.add_edge(socket_id, key.clone()) {
            debug!(socket = %socket_id, key = %key, "Publishing");
            state.assign_receiver(&key, socket_id);
        }
    }
}

impl State {
    /// Handle a message that only peers may send.
    pub(crate) fn handle_peer_message(&mut self, peer: PeerId, message: Message) {
        match message {
            Message::PeerSync { id, bundle } => {
                if id != peer {
                    warn!(peer = %peer, claimed = %id, "Peer sync id mismatch");
                }
                self.handle_peer_sync(peer, bundle);
            }
            Message::PeerSyncResponse { .. } => self.handle_peer_sync_response(peer),
            Message::PublisherOpen {
                key,
                socket_id,
                credentials,
            } => self.handle_publisher_open(peer, key, socket_id, credentials),
            Message::PublisherClose { key, socket_id } => {
                self.handle_publisher_close(peer, key, socket_id);
            }
            Message::PublisherPeerMessage {
                key,
                socket_id,
                message,
            } => self.handle_publisher_peer_message(peer, key, socket_id, message),
            Message::BraidEvent {
                name,
                args,
                id,
                ids,
            } => self.handle_braid_event(name, args, id, ids),
            Message::BraidSocketEvent {
                name,
                socket_id,
                args,
                id,
                ids,
            } => self.handle_braid_socket_event(name, socket_id, args, id, ids),
            dump => self.handle_dump(dump),
        }
    }
}
