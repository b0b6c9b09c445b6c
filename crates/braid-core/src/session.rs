//! Publisher session indices.
//!
//! A session is one publishing socket on one key. The publishing peer maps
//! each session to the peer serving it; the serving peer maps each session
//! to the receive pattern that matched and the peer it came from. Both are
//! [`SessionManager`]s and support removal by session, by socket or by target.

use braid_protocol::SocketId;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::graph::DirectedGraphMap;

/// A `(key, socket)` publisher session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub key: String,
    pub socket_id: SocketId,
}

impl SessionKey {
    /// Create a session key.
    #[must_use]
    pub fn new(key: impl Into<String>, socket_id: SocketId) -> Self {
        Self {
            key: key.into(),
            socket_id,
        }
    }
}

/// Maps sessions to the targets handling them.
#[derive(Debug, Clone)]
pub struct SessionManager<T> {
    graph: DirectedGraphMap<SessionKey, T>,
    by_socket: HashMap<SocketId, HashSet<SessionKey>>,
}

impl<T> Default for SessionManager<T> {
    fn default() -> Self {
        Self {
            graph: DirectedGraphMap::default(),
            by_socket: HashMap::new(),
        }
    }
}

impl<T> SessionManager<T>
where
    T: Eq + Hash + Clone,
{
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Relate a session to a target.
    pub fn add(&mut self, session: SessionKey, target: T) -> bool {
        self.by_socket
            .entry(session.socket_id)
            .or_default()
            .insert(session.clone());
        self.graph.add_edge(session, target)
    }

    fn unindex(&mut self, session: &SessionKey) {
        if let Some(sessions) = self.by_socket.get_mut(&session.socket_id) {
            sessions.remove(session);
            if sessions.is_empty() {
                self.by_socket.remove(&session.socket_id);
            }
        }
    }

    /// Remove a session, returning the targets it was related to.
    pub fn remove(&mut self, session: &SessionKey) -> Vec<T> {
        self.unindex(session);
        self.graph.remove_source(session)
    }

    /// Remove every session of a socket.
    pub fn remove_socket(&mut self, socket_id: SocketId) -> Vec<(SessionKey, Vec<T>)> {
        let Some(sessions) = self.by_socket.remove(&socket_id) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionKey> = sessions.into_iter().collect();
        sessions.sort();
        sessions
            .into_iter()
            .map(|session| {
                let targets = self.graph.remove_source(&session);
                (session, targets)
            })
            .collect()
    }

    /// Remove a target from every session, returning sessions left with no
    /// target.
    pub fn remove_target(&mut self, target: &T) -> Vec<SessionKey> {
        let sessions = self.graph.remove_target(target);
        let orphaned: Vec<SessionKey> = sessions
            .into_iter()
            .filter(|session| !self.graph.has_source(session))
            .collect();
        for session in &orphaned {
            self.unindex(session);
        }
        orphaned
    }

    /// Targets of a session.
    #[must_use]
    pub fn targets(&self, session: &SessionKey) -> Vec<T> {
        self.graph.get_targets(session).cloned().collect()
    }

    /// First target of a session.
    #[must_use]
    pub fn target(&self, session: &SessionKey) -> Option<T> {
        self.graph.get_targets(session).next().cloned()
    }

    /// All `(session, target)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&SessionKey, &T)> {
        self.graph.edges()
    }

    /// Check if a session exists.
    #[must_use]
    pub fn has(&self, session: &SessionKey) -> bool {
        self.graph.has_source(session)
    }

    /// Whether no session is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty() && self.by_socket.is_empty()
    }
}
