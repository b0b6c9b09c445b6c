//! Publisher session routing.
//!
//! A publishing socket on key `k` forms the session `(k, socket)`. The
//! publisher's server maps it to the peer serving it in
//! `publisher_server_sessions`; the serving server maps it to the matched
//! receive pattern and the origin peer in `publisher_sessions`. A local
//! receiver is preferred, otherwise a random direct peer with a matching
//! receive pattern serves the session one hop away.

use braid_core::SessionKey;
use braid_protocol::{Message, PeerId, SocketId};
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::state::{ReceiveTarget, State};

impl State {
    /// Write `receivers[self]` from the local registrations.
    pub(crate) fn publish_own_receivers(&mut self) {
        let mut patterns: Vec<String> = self.local_receivers.keys().cloned().collect();
        patterns.sort();
        if patterns.is_empty() {
            if self.receivers.has(&self.id) {
                let update = self.receivers.delete(&self.id);
                self.publish_receivers(update.queue);
            }
            return;
        }
        if self.receivers.get(&self.id) == Some(&patterns) {
            return;
        }
        let update = self.receivers.set(self.id, patterns);
        self.publish_receivers(update.queue);
    }

    fn local_receive_pattern(&mut self, key: &str) -> Option<String> {
        let mut patterns: Vec<&String> = self.local_receivers.keys().collect();
        patterns.sort();
        let matching = patterns
            .into_iter()
            .find(|pattern| self.patterns.is_match(pattern, key))
            .cloned();
        matching
    }

    fn peer_receives(&mut self, peer: PeerId, key: &str) -> bool {
        let Some(patterns) = self.receivers.get(&peer) else {
            return false;
        };
        patterns
            .iter()
            .any(|pattern| self.patterns.is_match(pattern, key))
    }

    /// Route a publisher session to a receiver.
    pub(crate) fn assign_receiver(&mut self, key: &str, socket_id: SocketId) {
        self.assign_receiver_excluding(key, socket_id, None);
    }

    fn assign_receiver_excluding(&mut self, key: &str, socket_id: SocketId, exclude: Option<PeerId>) {
        let session = SessionKey::new(key, socket_id);
        let credentials = self
            .sockets
            .get(&socket_id)
            .and_then(|entry| entry.credentials.clone());

        if exclude != Some(self.id) {
            if let Some(pattern) = self.local_receive_pattern(key) {
                debug!(key = %key, socket = %socket_id, pattern = %pattern, "Serving publisher locally");
                self.publisher_server_sessions.add(session.clone(), self.id);
                self.open_served_session(session, pattern, self.id, credentials);
                return;
            }
        }

        let mut candidates: Vec<PeerId> = Vec::new();
        for peer in self.direct_peers() {
            if Some(peer) != exclude && self.peer_receives(peer, key) {
                candidates.push(peer);
            }
        }
        let Some(&peer) = candidates.choose(&mut rand::thread_rng()) else {
            warn!(key = %key, socket = %socket_id, "No receiver matches key");
            return;
        };
        debug!(key = %key, socket = %socket_id, peer = %peer, "Routing publisher to peer");
        self.publisher_server_sessions.add(session, peer);
        self.send_to_peer(
            peer,
            &Message::PublisherOpen {
                key: key.to_string(),
                socket_id,
                credentials,
            },
        );
    }

    /// Close a publisher session on whichever peer serves it.
    pub(crate) fn unassign_receiver(&mut self, key: &str, socket_id: SocketId) {
        let session = SessionKey::new(key, socket_id);
        let servers = self.publisher_server_sessions.remove(&session);
        self.close_publisher_session(&session, servers);
    }

    /// Close every publisher session of a socket that went away.
    pub(crate) fn unassign_socket(&mut self, socket_id: SocketId) {
        for (session, servers) in self.publisher_server_sessions.remove_socket(socket_id) {
            self.close_publisher_session(&session, servers);
        }
    }

    fn close_publisher_session(&mut self, session: &SessionKey, servers: Vec<PeerId>) {
        for peer in servers {
            if peer == self.id {
                self.close_served_session(session);
            } else {
                self.send_to_peer(
                    peer,
                    &Message::PublisherClose {
                        key: session.key.clone(),
                        socket_id: session.socket_id,
                    },
                );
            }
        }
    }

    fn open_served_session(
        &mut self,
        session: SessionKey,
        pattern: String,
        origin: PeerId,
        credentials: Option<Value>,
    ) {
        let on_open = self
            .local_receivers
            .get(&pattern)
            .map(|receiver| receiver.on_open.clone());
        self.publisher_sessions
            .add(session.clone(), ReceiveTarget { pattern, origin });
        if let Some(on_open) = on_open {
            self.defer(move || on_open(&session.key, session.socket_id, credentials));
        }
    }

    /// Forget a session served here and report it closed.
    pub(crate) fn close_served_session(&mut self, session: &SessionKey) {
        for target in self.publisher_sessions.remove(session) {
            if let Some(receiver) = self.local_receivers.get(&target.pattern) {
                let on_close = receiver.on_close.clone();
                let session = session.clone();
                self.defer(move || on_close(&session.key, session.socket_id));
            }
        }
    }

    fn deliver_to_receivers(&mut self, session: &SessionKey, message: Value) {
        let targets = self.publisher_sessions.targets(session);
        if targets.is_empty() {
            warn!(key = %session.key, socket = %session.socket_id, "No session for publisher message");
            return;
        }
        for target in targets {
            if let Some(receiver) = self.local_receivers.get(&target.pattern) {
                let on_message = receiver.on_message.clone();
                let session = session.clone();
                let message = message.clone();
                self.defer(move || on_message(&session.key, session.socket_id, message));
            }
        }
    }

    /// A payload from a publishing socket connected here.
    pub(crate) fn handle_publisher_message(&mut self, socket_id: SocketId, key: String, message: Value) {
        if !self.publications.has_edge(&socket_id, &key) {
            warn!(key = %key, socket = %socket_id, "Publisher message without publication");
            return;
        }
        let session = SessionKey::new(key, socket_id);
        match self.publisher_server_sessions.target(&session) {
            None => warn!(key = %session.key, socket = %socket_id, "Publisher session has no receiver"),
            Some(peer) if peer == self.id => self.deliver_to_receivers(&session, message),
            Some(peer) => {
                trace!(key = %session.key, socket = %socket_id, peer = %peer, "Relaying publisher message");
                self.send_to_peer(
                    peer,
                    &Message::PublisherPeerMessage {
                        key: session.key,
                        socket_id,
                        message,
                    },
                );
            }
        }
    }

    /// A payload relayed by the publisher's server.
    pub(crate) fn handle_publisher_peer_message(
        &mut self,
        peer: PeerId,
        key: String,
        socket_id: SocketId,
        message: Value,
    ) {
        let session = SessionKey::new(key, socket_id);
        let from_origin = self
            .publisher_sessions
            .target(&session)
            .is_some_and(|target| target.origin == peer);
        if !from_origin {
            warn!(key = %session.key, socket = %socket_id, peer = %peer, "Relayed message for unknown session");
            return;
        }
        self.deliver_to_receivers(&session, message);
    }

    /// A peer asks this server to serve a publisher session.
    pub(crate) fn handle_publisher_open(
        &mut self,
        peer: PeerId,
        key: String,
        socket_id: SocketId,
        credentials: Option<Value>,
    ) {
        let Some(pattern) = self.local_receive_pattern(&key) else {
            debug!(key = %key, socket = %socket_id, peer = %peer, "Declining publisher session");
            self.send_to_peer(peer, &Message::PublisherClose { key, socket_id });
            return;
        };
        let session = SessionKey::new(key, socket_id);
        if self.publisher_sessions.has(&session) {
            self.close_served_session(&session);
        }
        self.open_served_session(session, pattern, peer, credentials);
    }

    /// A session closed by either end.
    pub(crate) fn handle_publisher_close(&mut self, peer: PeerId, key: String, socket_id: SocketId) {
        let session = SessionKey::new(key, socket_id);

        // The publisher went away.
        let served_for_peer = self
            .publisher_sessions
            .target(&session)
            .is_some_and(|target| target.origin == peer);
        if served_for_peer {
            self.close_served_session(&session);
            return;
        }

        // The serving peer dropped the session.
        if self.publisher_server_sessions.target(&session) == Some(peer) {
            self.publisher_server_sessions.remove(&session);
            if self.publications.has_edge(&socket_id, &session.key) {
                self.assign_receiver_excluding(&session.key, socket_id, Some(peer));
            }
        }
    }

    fn target_is_valid(&mut self, key: &str, peer: PeerId) -> bool {
        if peer == self.id {
            return self.local_receive_pattern(key).is_some();
        }
        self.direct_peers().contains(&peer) && self.peer_receives(peer, key)
    }

    /// Move publications whose receiver no longer matches, and route the
    /// ones that had none.
    pub(crate) fn reassign_publications(&mut self) {
        let publications: Vec<(SocketId, String)> = self
            .publications
            .edges()
            .map(|(socket_id, key)| (*socket_id, key.clone()))
            .collect();
        for (socket_id, key) in publications {
            let session = SessionKey::new(key.as_str(), socket_id);
            let target = self.publisher_server_sessions.target(&session);
            match target {
                Some(peer) if self.target_is_valid(&key, peer) => {}
                Some(_) => {
                    self.unassign_receiver(&key, socket_id);
                    self.assign_receiver(&key, socket_id);
                }
                None => self.assign_receiver(&key, socket_id),
            }
        }
    }

    /// Withdraw a receive registration, closing the sessions it served.
    pub(crate) fn unreceive(&mut self, pattern: &str) -> bool {
        let Some(receiver) = self.local_receivers.remove(pattern) else {
            return false;
        };
        // Peers must see the registration gone before they are told to
        // reroute, or they may pick this server again.
        self.publish_own_receivers();

        let sessions: Vec<(SessionKey, ReceiveTarget)> = self
            .publisher_sessions
            .entries()
            .filter(|(_, target)| target.pattern == pattern)
            .map(|(session, target)| (session.clone(), target.clone()))
            .collect();
        for (session, target) in sessions {
            self.publisher_sessions.remove(&session);
            let on_close = receiver.on_close.clone();
            let closed = session.clone();
            self.defer(move || on_close(&closed.key, closed.socket_id));

            if target.origin == self.id {
                self.publisher_server_sessions.remove(&session);
                if self.publications.has_edge(&session.socket_id, &session.key) {
                    self.assign_receiver(&session.key, session.socket_id);
                }
            } else {
                self.send_to_peer(
                    target.origin,
                    &Message::PublisherClose {
                        key: session.key,
                        socket_id: session.socket_id,
                    },
                );
            }
        }
        self.reassign_publications();
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::server::state::SocketEntry;
    use crate::server::{Server, ServerConfig};
    use braid_core::SessionKey;
    use braid_protocol::{PeerId, SocketId};
    use braid_transport::{SocketHandle, SocketLimits};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Open(String, Option<Value>),
        Message(String, Value),
        Close(String),
    }

    type Log = Arc<Mutex<Vec<Seen>>>;

    fn receive(server: &Server, pattern: &str, log: &Log) {
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        server
            .receive(
                pattern,
                move |key, _, message| a.lock().unwrap().push(Seen::Message(key.to_string(), message)),
                move |key, _, credentials| b.lock().unwrap().push(Seen::Open(key.to_string(), credentials)),
                move |key, _| c.lock().unwrap().push(Seen::Close(key.to_string())),
            )
            .unwrap();
    }

    fn publish(server: &Server, socket_id: SocketId, key: &str) {
        let mut state = server.inner.state.lock();
        if !state.sockets.contains_key(&socket_id) {
            let (handle, _) = SocketHandle::channel(socket_id, None, SocketLimits::default());
            state.sockets.insert(
                socket_id,
                SocketEntry {
                    handle,
                    credentials: Some(json!({"user": "u"})),
                },
            );
        }
        state.publications.add_edge(socket_id, key.to_string());
        state.assign_receiver(key, socket_id);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_local_session_lifecycle() {
        let server = Server::new(ServerConfig {
            peer_id: Some(PeerId(3)),
            ..ServerConfig::default()
        });
        let log = Log::default();
        receive(&server, "^jobs$", &log);

        let socket = SocketId(11);
        publish(&server, socket, "jobs");
        server
            .inner
            .state
            .lock()
            .handle_publisher_message(socket, "jobs".to_string(), json!({"n": 1}));
        server.inner.state.lock().unassign_receiver("jobs", socket);
        settle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Seen::Open("jobs".to_string(), Some(json!({"user": "u"}))),
                Seen::Message("jobs".to_string(), json!({"n": 1})),
                Seen::Close("jobs".to_string()),
            ]
        );
        let state = server.inner.state.lock();
        assert!(state.publisher_sessions.is_empty());
        assert!(state.publisher_server_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_socket_removal_closes_all_its_sessions() {
        let server = Server::new(ServerConfig {
            peer_id: Some(PeerId(3)),
            ..ServerConfig::default()
        });
        let log = Log::default();
        receive(&server, "^jobs:", &log);

        let socket = SocketId(13);
        publish(&server, socket, "jobs:a");
        publish(&server, socket, "jobs:b");
        publish(&server, SocketId(14), "jobs:a");
        server.remove_socket(socket);
        settle().await;

        let closed: Vec<Seen> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| matches!(seen, Seen::Close(_)))
            .cloned()
            .collect();
        assert_eq!(
            closed,
            vec![
                Seen::Close("jobs:a".to_string()),
                Seen::Close("jobs:b".to_string()),
            ]
        );
        let state = server.inner.state.lock();
        assert!(!state.publications.has_source(&socket));
        assert!(state.publisher_server_sessions.has(&SessionKey::new("jobs:a", SocketId(14))));
        assert!(!state.publisher_server_sessions.has(&SessionKey::new("jobs:b", socket)));
    }

    #[tokio::test]
    async fn test_late_receiver_picks_up_publication() {
        let server = Server::new(ServerConfig {
            peer_id: Some(PeerId(3)),
            ..ServerConfig::default()
        });
        let socket = SocketId(12);
        publish(&server, socket, "jobs");
        assert!(server.inner.state.lock().publisher_server_sessions.is_empty());

        let log = Log::default();
        receive(&server, "^jobs", &log);
        assert!(server.unreceive("^jobs"));
        settle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Seen::Open("jobs".to_string(), Some(json!({"user": "u"}))),
                Seen::Close("jobs".to_string()),
            ]
        );
        assert!(!server.unreceive("^jobs"));
    }

    #[tokio::test]
    async fn test_message_without_publication_is_dropped() {
        let server = Server::new(ServerConfig::default());
        let log = Log::default();
        receive(&server, ".*", &log);
        server
            .inner
            .state
            .lock()
            .handle_publisher_message(SocketId(1), "x".to_string(), json!(1));
        settle().await;
        assert!(log.lock().unwrap().is_empty());
    }
}
