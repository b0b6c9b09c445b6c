//! The routing and replication engine.
//!
//! A [`Server`] owns every replicated map, the socket and peer indices,
//! provider election and publisher session routing. The websocket layer
//! feeds it sockets and frames through [`Server::add_socket`],
//! [`Server::handle_socket_frame`] and [`Server::remove_socket`]; outbound
//! peer links are dialed by the engine itself.

mod custom;
mod peers;
mod providers;
mod receivers;
mod replication;
mod sockets;
pub(crate) mod state;
mod subscriptions;
mod sync;

use braid_core::dedup;
use braid_protocol::{PeerId, SocketId};
use braid_transport::{codes, SocketHandle, SocketLimits};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth::{
    CredentialsRequest, EventSubscribeRequest, Handlers, PeerRequest, PublishRequest,
    RequestHandler, SubscribeRequest,
};
use crate::error::ServerError;
use crate::events::{ServerEvent, EVENT_CAPACITY};

pub use custom::{CustomMap, CustomSet};
pub use state::{CloseCallback, MessageCallback, OpenCallback, ProvideCallback};

use state::{Deferred, LocalProvider, LocalReceiver, Origin, State};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Fixed peer id. Random if unset.
    pub peer_id: Option<PeerId>,
    /// Payload and backpressure limits for every socket and link.
    pub limits: SocketLimits,
    /// Timeout for credentials and peer responses.
    pub handshake_timeout: Duration,
    /// Timeout for a full peer sync.
    pub sync_timeout: Duration,
    /// Heartbeat interval on outbound links.
    pub heartbeat_interval: Duration,
    /// Silence after which an outbound link is dead.
    pub heartbeat_timeout: Duration,
    /// Interval of tombstone and multipart maintenance.
    pub flush_interval: Duration,
    /// Tombstone retention.
    pub tombstone_max_age: Duration,
    /// Grace period before a key without subscribers is deleted.
    pub key_expiry: Duration,
    /// Skip `set` calls that would not change a value.
    pub deduplicate: bool,
    /// Insertions per data chunk streamed to a newly linked peer.
    pub sync_chunk_size: usize,
    /// Time allowed for sockets and links to close on shutdown.
    pub close_timeout: Duration,
    /// Time allowed for the chunks of a multipart message to arrive.
    pub multipart_timeout: Duration,
    /// Recently forwarded payload hashes remembered for dedup.
    pub dedup_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            limits: SocketLimits::default(),
            handshake_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            flush_interval: Duration::from_secs(10),
            tombstone_max_age: Duration::from_secs(300),
            key_expiry: Duration::from_secs(24 * 60 * 60),
            deduplicate: false,
            sync_chunk_size: 100,
            close_timeout: Duration::from_secs(10),
            multipart_timeout: braid_protocol::multipart::DEFAULT_ASSEMBLY_TIMEOUT,
            dedup_capacity: dedup::DEFAULT_CAPACITY,
        }
    }
}

/// Options of a provide registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvideOptions {
    /// Delay before reporting `(key, false)` after the last subscriber
    /// leaves. Re-subscribing within the delay keeps the provider active.
    pub debounce: Option<Duration>,
}

/// Per-socket credentials queue.
pub(crate) struct CredentialGate {
    pub tx: mpsc::UnboundedSender<Value>,
    pub pending: watch::Sender<usize>,
}

pub(crate) struct Inner {
    pub id: PeerId,
    pub config: ServerConfig,
    pub state: Mutex<State>,
    pub handlers: RwLock<Handlers>,
    pub events: broadcast::Sender<ServerEvent>,
    pub closing: AtomicBool,
    pub socket_count: watch::Sender<usize>,
    pub credential_gates: DashMap<SocketId, CredentialGate>,
}

impl Inner {
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// A braid server node.
///
/// Cloning is cheap; all clones drive the same node. Must be created inside
/// a tokio runtime.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("id", &self.inner.id).finish()
    }
}

impl Server {
    /// Create a server node.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let id = config.peer_id.unwrap_or_else(PeerId::generate);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel::<Deferred>();
        let (socket_count, _) = watch::channel(0);

        let inner = Arc::new_cyclic(|weak| Inner {
            id,
            state: Mutex::new(State::new(
                id,
                config.clone(),
                weak.clone(),
                deferred_tx,
                events.clone(),
            )),
            config,
            handlers: RwLock::new(Handlers::default()),
            events,
            closing: AtomicBool::new(false),
            socket_count,
            credential_gates: DashMap::new(),
        });

        tokio::spawn(async move {
            while let Some(callback) = deferred_rx.recv().await {
                callback();
            }
        });

        let weak = Arc::downgrade(&inner);
        let flush_interval = inner.config.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_closing() {
                    break;
                }
                inner.state.lock().flush();
            }
        });

        info!(peer = %id, "Server created");
        Self { inner }
    }

    /// This node's peer id.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Listen to engine events. Drop the receiver to stop listening.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Set a replicated value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.deduplicate {
            if let Some(existing) = state.data.get(&key) {
                if dedup::hash_value(existing) == dedup::hash_value(&value) {
                    return;
                }
            }
        }
        let update = state.data.set(key, value);
        state.apply_local_data(update);
    }

    /// Delete a replicated value.
    pub fn delete(&self, key: &str) {
        let mut state = self.inner.state.lock();
        let update = state.data.delete(&key.to_string());
        if !update.is_empty() {
            state.apply_local_data(update);
        }
    }

    /// Current value of a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().data.get(&key.to_string()).cloned()
    }

    /// Check if a key has a value.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.inner.state.lock().data.has(&key.to_string())
    }

    /// All keys with a value.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().data.keys().cloned().collect()
    }

    /// Toggle skipping of `set` calls that would not change a value.
    pub fn set_deduplicate(&self, deduplicate: bool) {
        self.inner.state.lock().deduplicate = deduplicate;
    }

    /// Number of local mutations applied to the data map.
    #[must_use]
    pub fn data_mutation_count(&self) -> u64 {
        self.inner.state.lock().data.mutation_count()
    }

    /// Offer to provide values for keys matching `pattern`.
    ///
    /// `callback` receives `(key, true)` when this server is elected for a
    /// subscribed key and `(key, false)` when it loses the role.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidPattern`] if `pattern` is not a regex.
    pub fn provide(
        &self,
        pattern: &str,
        callback: impl Fn(&str, bool) + Send + Sync + 'static,
        options: ProvideOptions,
    ) -> Result<(), ServerError> {
        validate_pattern(pattern)?;
        let mut state = self.inner.state.lock();
        state.local_providers.insert(
            pattern.to_string(),
            LocalProvider {
                callback: Arc::new(callback),
                debounce: options.debounce,
            },
        );
        state.publish_own_providers();
        state.assign_all();
        Ok(())
    }

    /// Withdraw a provide registration. Returns `false` if none existed.
    pub fn unprovide(&self, pattern: &str) -> bool {
        self.inner.state.lock().unprovide(pattern)
    }

    /// Accept publisher sessions for keys matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidPattern`] if `pattern` is not a regex.
    pub fn receive(
        &self,
        pattern: &str,
        on_message: impl Fn(&str, SocketId, Value) + Send + Sync + 'static,
        on_open: impl Fn(&str, SocketId, Option<Value>) + Send + Sync + 'static,
        on_close: impl Fn(&str, SocketId) + Send + Sync + 'static,
    ) -> Result<(), ServerError> {
        validate_pattern(pattern)?;
        let mut state = self.inner.state.lock();
        state.local_receivers.insert(
            pattern.to_string(),
            LocalReceiver {
                on_message: Arc::new(on_message),
                on_open: Arc::new(on_open),
                on_close: Arc::new(on_close),
            },
        );
        state.publish_own_receivers();
        state.reassign_publications();
        Ok(())
    }

    /// Withdraw a receive registration. Returns `false` if none existed.
    pub fn unreceive(&self, pattern: &str) -> bool {
        self.inner.state.lock().unreceive(pattern)
    }

    /// Elected provider of a key.
    #[must_use]
    pub fn active_provider(&self, key: &str) -> Option<(PeerId, String)> {
        self.inner
            .state
            .lock()
            .active_providers
            .get(&key.to_string())
            .cloned()
    }

    /// Provide patterns of every known peer.
    #[must_use]
    pub fn providers(&self) -> HashMap<PeerId, Vec<String>> {
        let state = self.inner.state.lock();
        state.providers.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Receive patterns of every known peer.
    #[must_use]
    pub fn receivers(&self) -> HashMap<PeerId, Vec<String>> {
        let state = self.inner.state.lock();
        state.receivers.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Adjacency of every known peer.
    #[must_use]
    pub fn peer_graph(&self) -> HashMap<PeerId, Vec<PeerId>> {
        let state = self.inner.state.lock();
        state.peers.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Directly linked peers.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().direct_peers().into_iter().collect()
    }

    /// Number of accepted websockets, peer sockets included.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.inner.state.lock().sockets.len()
    }

    /// Broadcast a named event to every subscribed client in the mesh.
    pub fn emit_to_clients(&self, name: &str, args: Vec<Value>) {
        self.inner.state.lock().emit_to_clients(name, args);
    }

    /// Send a named event to one socket, wherever in the mesh it is.
    pub fn emit_to_socket(&self, name: &str, socket_id: SocketId, args: Vec<Value>) {
        self.inner.state.lock().emit_to_socket(name, socket_id, args);
    }

    /// Install the credentials handler.
    pub fn set_credentials_handler(
        &self,
        handler: impl RequestHandler<CredentialsRequest> + 'static,
    ) {
        self.inner.handlers.write().credentials = Some(Arc::new(handler));
    }

    /// Install the peer request handler.
    pub fn set_peer_request_handler(&self, handler: impl RequestHandler<PeerRequest> + 'static) {
        self.inner.handlers.write().peer = Some(Arc::new(handler));
    }

    /// Install the subscribe request handler.
    pub fn set_subscribe_request_handler(
        &self,
        handler: impl RequestHandler<SubscribeRequest> + 'static,
    ) {
        self.inner.handlers.write().subscribe = Some(Arc::new(handler));
    }

    /// Install the event subscribe request handler.
    pub fn set_event_subscribe_request_handler(
        &self,
        handler: impl RequestHandler<EventSubscribeRequest> + 'static,
    ) {
        self.inner.handlers.write().event_subscribe = Some(Arc::new(handler));
    }

    /// Install the publish request handler.
    pub fn set_publish_request_handler(
        &self,
        handler: impl RequestHandler<PublishRequest> + 'static,
    ) {
        self.inner.handlers.write().publish = Some(Arc::new(handler));
    }

    /// Register an accepted websocket.
    pub fn add_socket(&self, handle: SocketHandle) {
        self.inner.add_socket(handle);
    }

    /// Feed a binary frame received on a socket.
    pub fn handle_socket_frame(&self, socket_id: SocketId, data: Bytes) {
        self.inner.handle_frame(Origin::Socket(socket_id), data);
    }

    /// Forget a socket after its connection ended.
    pub fn remove_socket(&self, socket_id: SocketId) {
        self.inner.remove_socket(socket_id);
    }

    /// Shut down: stop timers, disconnect every peer, close every socket
    /// and wait up to the close timeout for them to go away.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.id(), "Server closing");

        let peers: Vec<PeerId> = {
            let mut state = self.inner.state.lock();
            state.reconnects.clear();
            state.reconnect_attempts.clear();
            state.deactivations.clear();
            state.expiring_keys.clear();
            state.peer_connections.keys().copied().collect()
        };
        join_all(peers.into_iter().map(|peer| self.disconnect_from_peer(peer))).await;

        let handles: Vec<SocketHandle> = {
            let state = self.inner.state.lock();
            state.sockets.values().map(|entry| entry.handle.clone()).collect()
        };
        for handle in &handles {
            handle.close(codes::GOING_AWAY, "Server closing");
        }

        let mut count = self.inner.socket_count.subscribe();
        let drained = tokio::time::timeout(
            self.inner.config.close_timeout,
            count.wait_for(|n| *n == 0),
        )
        .await;
        if drained.is_err() {
            let remaining: Vec<SocketId> = self.inner.state.lock().sockets.keys().copied().collect();
            warn!(count = remaining.len(), "Sockets did not close in time");
            for socket_id in remaining {
                self.inner.remove_socket(socket_id);
            }
        }

        let mut state = self.inner.state.lock();
        state.reconnects.clear();
        state.deactivations.clear();
        state.expiring_keys.clear();
        state.multipart.clear();
        debug!(peer = %self.id(), "Server closed");
    }

    /// Check that every socket, link and session index is empty.
    ///
    /// Meant for tests after [`Server::close`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::LeakedReferences`] naming every non-empty
    /// structure.
    pub fn check_leaked_references(&self) -> Result<(), ServerError> {
        let state = self.inner.state.lock();
        let checks = [
            ("sockets", state.sockets.is_empty()),
            ("peer_sockets", state.peer_sockets.is_empty()),
            ("subscriptions", state.subscriptions.is_empty()),
            ("event_subscriptions", state.event_subscriptions.is_empty()),
            ("publications", state.publications.is_empty()),
            ("peer_connections", state.peer_connections.is_empty()),
            ("reconnects", state.reconnects.is_empty()),
            ("sync_progress", state.sync_progress.is_empty()),
            ("pending_syncs", state.pending_syncs.is_empty()),
            (
                "publisher_server_sessions",
                state.publisher_server_sessions.is_empty(),
            ),
            ("publisher_sessions", state.publisher_sessions.is_empty()),
            ("deactivations", state.deactivations.is_empty()),
            ("expiring_keys", state.expiring_keys.is_empty()),
            ("multipart", state.multipart.is_empty()),
            ("credential_gates", self.inner.credential_gates.is_empty()),
        ];
        let leaked: Vec<String> = checks
            .iter()
            .filter(|(_, empty)| !empty)
            .map(|(name, _)| (*name).to_string())
            .collect();
        if leaked.is_empty() {
            Ok(())
        } else {
            Err(ServerError::LeakedReferences(leaked))
        }
    }
}

fn validate_pattern(pattern: &str) -> Result<(), ServerError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|source| ServerError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}
