//! Engine state.
//!
//! Everything the engine knows lives in one [`State`] behind a mutex that is
//! never held across an await. Operations that suspend (handlers, dialing,
//! timers, bulk streaming) release the lock, and re-check what they depend
//! on after taking it again.

use braid_core::crdt::Change;
use braid_core::{
    dedup, DirectedGraphMap, ObservedRemoveMap, ObservedRemoveSet, PatternCache, RecentHashes,
    SessionManager,
};
use braid_protocol::{
    codec, AssemblyLimits, Message, MessageType, MultipartAssembler, ProtocolError, PeerId, Queue, SetValue, SocketId,
};
use braid_transport::SocketHandle;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::{Inner, ServerConfig};
use crate::events::ServerEvent;
use crate::metrics;

/// Work run outside the state lock, in order.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// Invoked with `(key, active)` when the local provider role changes.
pub type ProvideCallback = std::sync::Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Invoked with `(key, socket, message)` for each publisher payload.
pub type MessageCallback = std::sync::Arc<dyn Fn(&str, SocketId, Value) + Send + Sync>;
/// Invoked with `(key, socket, credentials)` when a publisher session opens.
pub type OpenCallback = std::sync::Arc<dyn Fn(&str, SocketId, Option<Value>) + Send + Sync>;
/// Invoked with `(key, socket)` when a publisher session closes.
pub type CloseCallback = std::sync::Arc<dyn Fn(&str, SocketId) + Send + Sync>;

/// Where a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Origin {
    /// An accepted websocket, possibly promoted to a peer socket.
    Socket(SocketId),
    /// An outbound peer link.
    Link(PeerId),
}

/// An accepted websocket.
pub(crate) struct SocketEntry {
    pub handle: SocketHandle,
    pub credentials: Option<Value>,
}

/// An outbound peer link.
pub(crate) struct PeerConnection {
    pub handle: SocketHandle,
    pub address: String,
    pub credentials: Value,
    pub done: watch::Receiver<bool>,
}

/// A provide pattern registered on this server.
pub(crate) struct LocalProvider {
    pub callback: ProvideCallback,
    pub debounce: Option<Duration>,
}

/// A receive pattern registered on this server.
pub(crate) struct LocalReceiver {
    pub on_message: MessageCallback,
    pub on_open: OpenCallback,
    pub on_close: CloseCallback,
}

/// The pattern serving a publisher session and the peer the publisher is on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ReceiveTarget {
    pub pattern: String,
    pub origin: PeerId,
}

/// Progress of the full sync with one peer.
#[derive(Debug, Default)]
pub(crate) struct SyncProgress {
    pub response: bool,
    pub streamed: bool,
}

/// Cancellable timers keyed by `K`.
///
/// Each scheduled timer carries a generation. A timer that fires after it
/// was replaced or cancelled finds a different generation and does nothing.
pub(crate) struct Timers<K> {
    generation: u64,
    entries: HashMap<K, (u64, JoinHandle<()>)>,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> Timers<K> {
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Track a timer, aborting the one it replaces.
    pub fn insert(&mut self, key: K, generation: u64, handle: JoinHandle<()>) {
        if let Some((_, previous)) = self.entries.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    /// Remove the entry if it still belongs to `generation`.
    pub fn take_if_current(&mut self, key: &K, generation: u64) -> bool {
        if self.entries.get(key).is_some_and(|(g, _)| *g == generation) {
            self.entries.remove(key);
            return true;
        }
        false
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&mut self) {
        for (_, (_, handle)) in self.entries.drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Queue holding exactly the operations behind `changes`.
pub(crate) fn changes_to_queue<K: Clone, V: Clone>(changes: &[Change<K, V>]) -> Queue<K, V> {
    let mut queue = Queue::new();
    for change in changes {
        match change {
            Change::Set { key, id, value, .. } => {
                queue.insertions.push((key.clone(), *id, value.clone()));
            }
            Change::Delete { key, id, .. } => queue.deletions.push((key.clone(), *id)),
        }
    }
    queue
}

/// All replicated and local engine state.
pub(crate) struct State {
    pub id: PeerId,
    pub config: ServerConfig,
    pub weak: Weak<Inner>,
    pub deferred: mpsc::UnboundedSender<Deferred>,
    pub events: broadcast::Sender<ServerEvent>,
    pub deduplicate: bool,

    // Replicated
    pub data: ObservedRemoveMap<String, Value>,
    pub peers: ObservedRemoveMap<PeerId, Vec<PeerId>>,
    pub providers: ObservedRemoveMap<PeerId, Vec<String>>,
    pub receivers: ObservedRemoveMap<PeerId, Vec<String>>,
    pub active_providers: ObservedRemoveMap<String, (PeerId, String)>,
    pub peer_subscriptions: ObservedRemoveSet<(PeerId, String)>,
    pub custom_maps: HashMap<String, ObservedRemoveMap<String, Value>>,
    pub custom_sets: HashMap<String, ObservedRemoveSet<SetValue>>,

    // Sockets and links
    pub sockets: HashMap<SocketId, SocketEntry>,
    pub peer_sockets: DirectedGraphMap<SocketId, PeerId>,
    pub subscriptions: DirectedGraphMap<SocketId, String>,
    pub event_subscriptions: DirectedGraphMap<SocketId, String>,
    pub publications: DirectedGraphMap<SocketId, String>,
    pub peer_connections: HashMap<PeerId, PeerConnection>,
    pub reconnect_attempts: HashMap<String, u32>,
    pub reconnects: Timers<String>,
    pub sync_progress: HashMap<PeerId, SyncProgress>,
    pub pending_syncs: HashMap<PeerId, oneshot::Sender<()>>,

    // Publisher sessions
    pub publisher_server_sessions: SessionManager<PeerId>,
    pub publisher_sessions: SessionManager<ReceiveTarget>,

    // Local roles
    pub local_providers: HashMap<String, LocalProvider>,
    pub active_local: HashMap<String, String>,
    pub deactivations: Timers<String>,
    pub local_receivers: HashMap<String, LocalReceiver>,
    pub expiring_keys: Timers<String>,

    /// Incomplete multipart messages per sender.
    pub multipart: HashMap<Origin, MultipartAssembler>,
    pub recent: RecentHashes,
    pub patterns: PatternCache,
}

impl State {
    /// Feed a multipart chunk from `origin` into its assembler.
    ///
    /// Assembled frames are bounded by the socket backpressure ceiling, and
    /// so are the bytes one sender may keep in incomplete messages.
    pub fn push_multipart(
        &mut self,
        origin: Origin,
        id: u64,
        position: u32,
        length: u32,
        data: Vec<u8>,
    ) -> Result<Option<Bytes>, ProtocolError> {
        let timeout = self.config.multipart_timeout;
        let ceiling = self.config.limits.max_backpressure;
        let assembler = self.multipart.entry(origin).or_insert_with(|| {
            MultipartAssembler::with_limits(
                timeout,
                AssemblyLimits {
                    max_message_size: ceiling,
                    max_pending_bytes: ceiling,
                },
            )
        });
        let result = assembler.push(id, position, length, data);
        if assembler.is_empty() {
            self.multipart.remove(&origin);
        }
        result
    }

    pub fn new(
        id: PeerId,
        config: ServerConfig,
        weak: Weak<Inner>,
        deferred: mpsc::UnboundedSender<Deferred>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        let replica = id.0;
        let max_age = config.tombstone_max_age;
        Self {
            id,
            deduplicate: config.deduplicate,
            multipart: HashMap::new(),
            recent: RecentHashes::new(config.dedup_capacity),
            config,
            weak,
            deferred,
            events,
            data: ObservedRemoveMap::with_max_age(replica, max_age),
            peers: ObservedRemoveMap::with_max_age(replica, max_age),
            providers: ObservedRemoveMap::with_max_age(replica, max_age),
            receivers: ObservedRemoveMap::with_max_age(replica, max_age),
            active_providers: ObservedRemoveMap::with_max_age(replica, max_age),
            peer_subscriptions: ObservedRemoveSet::with_max_age(replica, max_age),
            custom_maps: HashMap::new(),
            custom_sets: HashMap::new(),
            sockets: HashMap::new(),
            peer_sockets: DirectedGraphMap::new(),
            subscriptions: DirectedGraphMap::new(),
            event_subscriptions: DirectedGraphMap::new(),
            publications: DirectedGraphMap::new(),
            peer_connections: HashMap::new(),
            reconnect_attempts: HashMap::new(),
            reconnects: Timers::default(),
            sync_progress: HashMap::new(),
            pending_syncs: HashMap::new(),
            publisher_server_sessions: SessionManager::new(),
            publisher_sessions: SessionManager::new(),
            local_providers: HashMap::new(),
            active_local: HashMap::new(),
            deactivations: Timers::default(),
            local_receivers: HashMap::new(),
            expiring_keys: Timers::default(),
            patterns: PatternCache::new(),
        }
    }

    /// Run `f` after the lock is released.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.deferred.send(Box::new(f));
    }

    pub fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Run `f` against the state after `delay`, unless the server is gone.
    pub fn spawn_timer(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut State) + Send + 'static,
    ) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                f(&mut state);
            }
        })
    }

    /// Peer behind an origin, if it is a peer at all.
    pub fn peer_of(&self, origin: Origin) -> Option<PeerId> {
        match origin {
            Origin::Link(peer) => Some(peer),
            Origin::Socket(socket_id) => self.peer_sockets.get_targets(&socket_id).next().copied(),
        }
    }

    /// Peers with an outbound link or a promoted inbound socket.
    pub fn direct_peers(&self) -> BTreeSet<PeerId> {
        self.peer_connections
            .keys()
            .chain(self.peer_sockets.targets())
            .copied()
            .collect()
    }

    /// Sending side towards a direct peer, preferring the outbound link.
    pub fn peer_handle(&self, peer: PeerId) -> Option<SocketHandle> {
        if let Some(connection) = self.peer_connections.get(&peer) {
            return Some(connection.handle.clone());
        }
        self.peer_sockets
            .get_sources(&peer)
            .find_map(|socket_id| self.sockets.get(socket_id))
            .map(|entry| entry.handle.clone())
    }

    pub fn send_to_socket(&self, socket_id: SocketId, message: &Message) {
        let Some(entry) = self.sockets.get(&socket_id) else {
            trace!(socket = %socket_id, "Dropping message for closed socket");
            return;
        };
        send(&entry.handle, message);
    }

    pub fn send_to_peer(&self, peer: PeerId, message: &Message) -> bool {
        match self.peer_handle(peer) {
            Some(handle) => send(&handle, message),
            None => {
                warn!(peer = %peer, message_type = %message.message_type(), "No link to peer");
                false
            }
        }
    }

    /// Send to every direct peer not in `seen`.
    ///
    /// The outgoing id list is `seen`, this peer and every direct peer, so a
    /// recipient only forwards to peers none of us reach.
    pub fn flood(&self, seen: &[PeerId], build: impl FnOnce(Vec<PeerId>) -> Message) {
        let direct = self.direct_peers();
        let targets: Vec<PeerId> = direct
            .iter()
            .filter(|peer| !seen.contains(peer))
            .copied()
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut ids: Vec<PeerId> = seen.iter().chain(direct.iter()).copied().collect();
        ids.push(self.id);
        ids.sort();
        ids.dedup();

        let message = build(ids);
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(message_type = %message.message_type(), error = %e, "Failed to encode flood");
                metrics::record_error("encode");
                return;
            }
        };
        for peer in targets {
            if let Some(handle) = self.peer_handle(peer) {
                metrics::record_message(frame.len(), "outbound");
                if let Err(e) = handle.send_encoded(frame.clone()) {
                    trace!(peer = %peer, error = %e, "Flood send failed");
                }
            }
        }
    }

    /// Record a flooded payload, returning `false` if it was seen recently.
    pub fn first_sighting<T: Serialize + ?Sized>(&mut self, kind: MessageType, payload: &T) -> bool {
        match dedup::hash_serialized(&(kind.as_str(), payload)) {
            Ok(hash) => {
                if self.recent.insert(hash) {
                    return true;
                }
                metrics::record_dedup_drop();
                trace!(message_type = %kind, "Already forwarded");
                false
            }
            Err(e) => {
                warn!(message_type = %kind, error = %e, "Failed to hash payload");
                true
            }
        }
    }

    /// Periodic maintenance.
    pub fn flush(&mut self) {
        let mut dropped = self.data.flush()
            + self.peers.flush()
            + self.providers.flush()
            + self.receivers.flush()
            + self.active_providers.flush()
            + self.peer_subscriptions.flush();
        for map in self.custom_maps.values_mut() {
            dropped += map.flush();
        }
        for set in self.custom_sets.values_mut() {
            dropped += set.flush();
        }

        let now = std::time::Instant::now();
        let mut expired = 0;
        self.multipart.retain(|_, assembler| {
            expired += assembler.expire(now).len();
            !assembler.is_empty()
        });
        if expired > 0 {
            warn!(count = expired, "Dropped incomplete multipart messages");
        }

        let mut patterns: Vec<String> = self.local_providers.keys().cloned().collect();
        patterns.extend(self.local_receivers.keys().cloned());
        for (_, registered) in self.providers.iter().chain(self.receivers.iter()) {
            patterns.extend(registered.iter().cloned());
        }
        self.patterns.retain(patterns.iter());

        metrics::set_data_keys(self.data.len());
        trace!(tombstones = dropped, "Flushed");
    }
}

/// Encode and queue one message.
pub(crate) fn send(handle: &SocketHandle, message: &Message) -> bool {
    match handle.send(message) {
        Ok(size) => {
            metrics::record_message(size, "outbound");
            true
        }
        Err(e) => {
            trace!(socket = %handle.id(), message_type = %message.message_type(), error = %e, "Send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_protocol::OpId;

    #[tokio::test]
    async fn test_timers_generation() {
        let mut timers: Timers<String> = Timers::default();
        let first = timers.next_generation();
        timers.insert("a".to_string(), first, tokio::spawn(async {}));
        let second = timers.next_generation();
        timers.insert("a".to_string(), second, tokio::spawn(async {}));

        assert_eq!(timers.len(), 1);
        assert!(!timers.take_if_current(&"a".to_string(), first));
        assert!(timers.take_if_current(&"a".to_string(), second));
        assert!(timers.is_empty());
        assert!(!timers.cancel(&"a".to_string()));
    }

    #[test]
    fn test_changes_to_queue() {
        let changes = vec![
            Change::Set {
                key: "a".to_string(),
                id: OpId::new(2, 1),
                value: 1,
                previous: None,
            },
            Change::Delete {
                key: "b".to_string(),
                id: OpId::new(1, 1),
                previous: 2,
            },
        ];
        let queue = changes_to_queue(&changes);
        assert_eq!(queue.insertions, vec![("a".to_string(), OpId::new(2, 1), 1)]);
        assert_eq!(queue.deletions, vec![("b".to_string(), OpId::new(1, 1))]);
    }
}
