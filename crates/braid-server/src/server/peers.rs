//! Peer links and topology.
//!
//! Outbound links are dialed here and survive ungraceful drops through
//! reconnects with quadratic backoff. Whenever the set of direct peers
//! changes, `peers[self]` is rewritten and peers no longer reachable in the
//! replicated adjacency are pruned from every map.

use braid_core::SessionKey;
use braid_protocol::dump::{ActiveProviderQueue, PeerSubscriptionQueue};
use braid_protocol::{Message, PeerId, SocketId};
use braid_transport::{
    codes, reconnect_delay, HandshakeError, LinkConfig, LinkEvent, PeerLink, SocketHandle,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::state::{Origin, PeerConnection, State, SyncProgress};
use super::{Inner, Server};
use crate::error::ServerError;
use crate::events::ServerEvent;
use crate::metrics;

impl State {
    /// A direct link came up: announce it and start the full sync.
    pub(crate) fn link_established(&mut self, peer: PeerId) {
        info!(peer = %peer, "Peer linked");
        self.update_own_peers();
        self.reassert_own_entries();
        self.sync_progress.insert(peer, SyncProgress::default());
        let bundle = self.build_bundle();
        self.send_to_peer(peer, &Message::PeerSync { id: self.id, bundle });
        metrics::set_active_peers(self.direct_peers().len());
        self.emit(ServerEvent::AddPeer(peer));
    }

    /// Re-set this peer's registrations and subscription markers with fresh
    /// ids, so they win over removals other replicas made while unlinked.
    pub(crate) fn reassert_own_entries(&mut self) {
        let mut patterns: Vec<String> = self.local_providers.keys().cloned().collect();
        if !patterns.is_empty() {
            patterns.sort();
            let update = self.providers.set(self.id, patterns);
            self.publish_providers(update.queue);
        }
        let mut patterns: Vec<String> = self.local_receivers.keys().cloned().collect();
        if !patterns.is_empty() {
            patterns.sort();
            let update = self.receivers.set(self.id, patterns);
            self.publish_receivers(update.queue);
        }
        let keys: Vec<String> = self.subscriptions.targets().cloned().collect();
        let mut queue = PeerSubscriptionQueue::new();
        for key in keys {
            queue.extend(self.peer_subscriptions.add((self.id, key)).queue);
        }
        self.publish_peer_subscriptions(queue);
    }

    /// Forget a peer that is no longer directly linked.
    pub(crate) fn remove_peer(&mut self, peer: PeerId) {
        if self.direct_peers().contains(&peer) {
            return;
        }
        info!(peer = %peer, "Peer unlinked");
        self.update_own_peers();
        self.drop_peer_sessions(peer);
        self.sync_progress.remove(&peer);
        self.pending_syncs.remove(&peer);
        metrics::set_active_peers(self.direct_peers().len());
        self.emit(ServerEvent::RemovePeer(peer));
        self.prune();
    }

    /// Peers reachable from this one through the replicated adjacency.
    fn reachable_peers(&self) -> HashSet<PeerId> {
        let mut reachable = HashSet::from([self.id]);
        let mut stack = vec![self.id];
        while let Some(peer) = stack.pop() {
            let neighbors: Vec<PeerId> = if peer == self.id {
                self.direct_peers().into_iter().collect()
            } else {
                self.peers.get(&peer).cloned().unwrap_or_default()
            };
            for neighbor in neighbors {
                if reachable.insert(neighbor) {
                    stack.push(neighbor);
                }
            }
        }
        reachable
    }

    /// Remove every trace of peers that can no longer be reached.
    pub(crate) fn prune(&mut self) {
        let reachable = self.reachable_peers();
        let mut known: BTreeSet<PeerId> = self
            .peers
            .keys()
            .chain(self.providers.keys())
            .chain(self.receivers.keys())
            .copied()
            .collect();
        known.extend(self.peer_subscriptions.values().map(|(peer, _)| *peer));
        known.extend(self.active_providers.iter().map(|(_, (peer, _))| *peer));

        for peer in known {
            if !reachable.contains(&peer) {
                self.forget_peer(peer);
            }
        }
    }

    fn forget_peer(&mut self, peer: PeerId) {
        info!(peer = %peer, "Pruning unreachable peer");
        let update = self.peers.delete(&peer);
        self.publish_peers(update.queue);
        let update = self.providers.delete(&peer);
        self.publish_providers(update.queue);
        let update = self.receivers.delete(&peer);
        self.publish_receivers(update.queue);

        let stale: Vec<(PeerId, String)> = self
            .peer_subscriptions
            .values()
            .filter(|(subscriber, _)| *subscriber == peer)
            .cloned()
            .collect();
        let mut keys = Vec::with_capacity(stale.len());
        let mut queue = PeerSubscriptionQueue::new();
        for entry in stale {
            queue.extend(self.peer_subscriptions.delete(&entry).queue);
            keys.push(entry.1);
        }
        self.publish_peer_subscriptions(queue);

        let provided: Vec<String> = self
            .active_providers
            .iter()
            .filter(|(_, (provider, _))| *provider == peer)
            .map(|(key, _)| key.clone())
            .collect();
        let mut queue = ActiveProviderQueue::new();
        for key in &provided {
            queue.extend(self.active_providers.delete(key).queue);
        }
        self.publish_active_providers(queue);

        self.drop_peer_sessions(peer);
        for key in keys.into_iter().chain(provided) {
            self.subscribers_changed(&key);
        }
    }

    /// Reroute or close publisher sessions that depended on `peer`.
    pub(crate) fn drop_peer_sessions(&mut self, peer: PeerId) {
        for session in self.publisher_server_sessions.remove_target(&peer) {
            if self.publications.has_edge(&session.socket_id, &session.key) {
                debug!(key = %session.key, socket = %session.socket_id, "Rerouting publisher session");
                self.assign_receiver(&session.key, session.socket_id);
            }
        }

        let served: Vec<SessionKey> = self
            .publisher_sessions
            .entries()
            .filter(|(_, target)| target.origin == peer)
            .map(|(session, _)| session.clone())
            .collect();
        for session in served {
            self.close_served_session(&session);
        }
    }

    /// Dial `address` again after a backoff delay.
    pub(crate) fn schedule_reconnect(&mut self, address: String, credentials: Value) {
        if self.weak.upgrade().map_or(true, |inner| inner.is_closing()) {
            return;
        }
        let attempt = self.reconnect_attempts.entry(address.clone()).or_insert(0);
        *attempt += 1;
        let delay = reconnect_delay(*attempt);
        info!(address = %address, attempt = *attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let generation = self.reconnects.next_generation();
        let key = address.clone();
        let handle = self.spawn_timer(delay, move |state| {
            if state.reconnects.take_if_current(&key, generation) {
                state.spawn_connect(key, credentials);
            }
        });
        self.reconnects.insert(address, generation, handle);
    }

    /// Dial in the background, rescheduling on failure.
    pub(crate) fn spawn_connect(&self, address: String, credentials: Value) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            match inner.connect_to_peer(&address, credentials.clone()).await {
                Ok(_) | Err(ServerError::Closing | ServerError::SelfLink) => {}
                Err(e) => {
                    warn!(address = %address, error = %e, "Peer connect failed");
                    inner.state.lock().schedule_reconnect(address, credentials);
                }
            }
        });
    }
}

impl Inner {
    /// Dial a peer, run both handshakes and register the link.
    ///
    /// Resolves after the full sync completed or timed out.
    pub(crate) async fn connect_to_peer(
        self: &Arc<Self>,
        address: &str,
        credentials: Value,
    ) -> Result<PeerId, ServerError> {
        if self.is_closing() {
            return Err(ServerError::Closing);
        }
        debug!(address = %address, "Dialing peer");
        let config = LinkConfig {
            limits: self.config.limits,
            handshake_timeout: self.config.handshake_timeout,
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
        };
        let mut link = PeerLink::connect(address, config).await?;

        if let Err(e) = link.send_credentials(credentials.clone()).await {
            link.close(codes::EXPLICIT_DISCONNECT, "Credentials rejected");
            return Err(e.into());
        }
        let remote = match link.send_peer_request(self.id).await {
            Ok(remote) => remote,
            Err(e) => {
                link.close(codes::EXPLICIT_DISCONNECT, "Peer request rejected");
                if let Some(existing) = e.duplicate_peer() {
                    debug!(address = %address, peer = %existing, "Already linked");
                    return Ok(existing);
                }
                if matches!(e, HandshakeError::Peer { peer_id: Some(id), .. } if id == self.id) {
                    return Err(ServerError::SelfLink);
                }
                return Err(e.into());
            }
        };
        if remote == self.id {
            link.close(codes::EXPLICIT_DISCONNECT, "Self link");
            return Err(ServerError::SelfLink);
        }

        let (handle, mut events) = link.into_parts();
        let (done_tx, done_rx) = watch::channel(false);
        let (sync_tx, sync_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if self.is_closing() {
                handle.close(codes::GOING_AWAY, "Server closing");
                return Err(ServerError::Closing);
            }
            if state.peer_connections.contains_key(&remote) {
                handle.close(codes::EXPLICIT_DISCONNECT, "Duplicate link");
                return Ok(remote);
            }
            // Simultaneous dials keep the link dialed by the lower id.
            let inbound: Vec<SocketId> = state.peer_sockets.get_sources(&remote).copied().collect();
            if !inbound.is_empty() {
                if self.id > remote {
                    handle.close(codes::EXPLICIT_DISCONNECT, "Duplicate link");
                    return Ok(remote);
                }
                for socket_id in inbound {
                    if let Some(entry) = state.sockets.get(&socket_id) {
                        entry.handle.close(codes::EXPLICIT_DISCONNECT, "Duplicate link");
                    }
                    state.peer_sockets.remove_edge(&socket_id, &remote);
                }
            }

            state.reconnects.cancel(&address.to_string());
            state.reconnect_attempts.remove(address);
            state.peer_connections.insert(
                remote,
                PeerConnection {
                    handle: handle.clone(),
                    address: address.to_string(),
                    credentials,
                    done: done_rx,
                },
            );
            state.pending_syncs.insert(remote, sync_tx);
            state.link_established(remote);
        }

        let weak = Arc::downgrade(self);
        let link_handle = handle;
        tokio::spawn(async move {
            let mut closed = false;
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    LinkEvent::Message(data) => inner.handle_frame(Origin::Link(remote), data),
                    LinkEvent::Closed { code, reason } => {
                        inner.link_closed(remote, &link_handle, code, &reason);
                        closed = true;
                        break;
                    }
                }
            }
            if !closed {
                if let Some(inner) = weak.upgrade() {
                    inner.link_closed(remote, &link_handle, codes::ABNORMAL, "Link dropped");
                }
            }
            let _ = done_tx.send(true);
        });

        match tokio::time::timeout(self.config.sync_timeout, sync_rx).await {
            Ok(Ok(())) => debug!(peer = %remote, "Peer sync completed"),
            Ok(Err(_)) => warn!(peer = %remote, "Link closed before sync completed"),
            Err(_) => warn!(peer = %remote, "Peer sync timed out"),
        }
        Ok(remote)
    }

    /// An outbound link closed.
    pub(crate) fn link_closed(&self, peer: PeerId, handle: &SocketHandle, code: u16, reason: &str) {
        let mut state = self.state.lock();
        let current = state
            .peer_connections
            .get(&peer)
            .is_some_and(|connection| connection.handle.same_as(handle));
        if !current {
            return;
        }
        let Some(connection) = state.peer_connections.remove(&peer) else {
            return;
        };
        info!(peer = %peer, code, reason = %reason, "Peer link closed");
        state.multipart.remove(&Origin::Link(peer));
        state.remove_peer(peer);
        if code != codes::EXPLICIT_DISCONNECT && !self.is_closing() {
            state.schedule_reconnect(connection.address, connection.credentials);
        }
    }
}

impl Server {
    /// Link to the peer at `address`.
    ///
    /// Resolves with the remote peer id once the full sync completed, or
    /// after the sync timeout. Dialing an already linked peer resolves with
    /// its id.
    ///
    /// # Errors
    ///
    /// Fails if the server is closing, the address is unreachable, either
    /// handshake is rejected, or the address belongs to this server.
    pub async fn connect_to_peer(
        &self,
        address: &str,
        credentials: Value,
    ) -> Result<PeerId, ServerError> {
        self.inner.connect_to_peer(address, credentials).await
    }

    /// Dial `address` in the background, retrying with backoff until the
    /// link comes up or the server closes.
    pub fn connect_in_background(&self, address: impl Into<String>, credentials: Value) {
        self.inner
            .state
            .lock()
            .spawn_connect(address.into(), credentials);
    }

    /// Close the link to a peer without reconnecting.
    ///
    /// Returns `false` if the peer was not directly linked.
    pub async fn disconnect_from_peer(&self, peer: PeerId) -> bool {
        let done = {
            let mut state = self.inner.state.lock();
            if let Some(connection) = state.peer_connections.remove(&peer) {
                state.reconnects.cancel(&connection.address);
                state.reconnect_attempts.remove(&connection.address);
                connection
                    .handle
                    .close(codes::EXPLICIT_DISCONNECT, "Disconnect");
                state.remove_peer(peer);
                Some(connection.done)
            } else {
                let sockets: Vec<SocketId> = state.peer_sockets.get_sources(&peer).copied().collect();
                if sockets.is_empty() {
                    return false;
                }
                for socket_id in sockets {
                    if let Some(entry) = state.sockets.get(&socket_id) {
                        entry.handle.close(codes::EXPLICIT_DISCONNECT, "Disconnect");
                    }
                    state.peer_sockets.remove_edge(&socket_id, &peer);
                }
                state.remove_peer(peer);
                None
            }
        };

        if let Some(mut done) = done {
            let finished = tokio::time::timeout(self.inner.config.close_timeout, done.wait_for(|d| *d))
                .await
                .is_ok();
            if !finished {
                warn!(peer = %peer, "Link did not close in time");
            }
        }
        true
    }
}
