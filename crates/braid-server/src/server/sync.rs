//! Full sync between newly linked peers.
//!
//! Both ends send a [`PeerSyncBundle`] with every control map. Each side
//! merges what it receives, answers with `PeerSyncResponse` and then streams
//! its data map in chunks, waiting for the socket to drain between chunks.
//! A link is synced once our bundle was acknowledged and our data stream
//! finished.

use braid_protocol::{Message, MessageType, PeerId, PeerSyncBundle, Queue};
use braid_transport::SocketHandle;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::state::{send, State};
use crate::events::ServerEvent;

impl State {
    /// Dumps of every control map.
    pub(crate) fn build_bundle(&self) -> PeerSyncBundle {
        let mut custom_maps: Vec<_> = self
            .custom_maps
            .iter()
            .map(|(name, map)| (name.clone(), map.dump()))
            .collect();
        custom_maps.sort_by(|a, b| a.0.cmp(&b.0));
        let mut custom_sets: Vec<_> = self
            .custom_sets
            .iter()
            .map(|(name, set)| (name.clone(), set.dump()))
            .collect();
        custom_sets.sort_by(|a, b| a.0.cmp(&b.0));

        PeerSyncBundle {
            peers: self.peers.dump(),
            providers: self.providers.dump(),
            active_providers: self.active_providers.dump(),
            receivers: self.receivers.dump(),
            peer_subscriptions: self.peer_subscriptions.dump(),
            custom_maps,
            custom_sets,
        }
    }

    /// Merge a peer's bundle, acknowledge it and stream our data back.
    pub(crate) fn handle_peer_sync(&mut self, peer: PeerId, bundle: PeerSyncBundle) {
        debug!(peer = %peer, "Received peer sync");
        let PeerSyncBundle {
            peers,
            providers,
            active_providers,
            receivers,
            peer_subscriptions,
            custom_maps,
            custom_sets,
        } = bundle;

        // Adjacency first, so the rest is judged against the merged topology.
        let merged = self.merge_peers(peers);
        self.forward_merged(peer, MessageType::PeerDump, merged, |queue, ids| {
            Message::PeerDump { queue, ids }
        });
        let merged = self.merge_providers(providers);
        self.forward_merged(peer, MessageType::ProviderDump, merged, |queue, ids| {
            Message::ProviderDump { queue, ids }
        });
        let merged = self.merge_receivers(receivers);
        self.forward_merged(peer, MessageType::ReceiverDump, merged, |queue, ids| {
            Message::ReceiverDump { queue, ids }
        });
        let merged = self.merge_peer_subscriptions(peer_subscriptions);
        self.forward_merged(peer, MessageType::PeerSubscriptionDump, merged, |queue, ids| {
            Message::PeerSubscriptionDump { queue, ids }
        });
        let merged = self.merge_active_providers(active_providers);
        self.forward_merged(peer, MessageType::ActiveProviderDump, merged, |queue, ids| {
            Message::ActiveProviderDump { queue, ids }
        });
        for (name, queue) in custom_maps {
            let merged = self.merge_custom_map(&name, queue);
            if !merged.is_empty() && self.first_sighting(MessageType::CustomMapDump, &(&name, &merged)) {
                self.flood(&[peer], |ids| Message::CustomMapDump {
                    name,
                    queue: merged,
                    ids,
                });
            }
        }
        for (name, queue) in custom_sets {
            let merged = self.merge_custom_set(&name, queue);
            if !merged.is_empty() && self.first_sighting(MessageType::CustomSetDump, &(&name, &merged)) {
                self.flood(&[peer], |ids| Message::CustomSetDump {
                    name,
                    queue: merged,
                    ids,
                });
            }
        }
        self.prune();

        let Some(handle) = self.peer_handle(peer) else {
            debug!(peer = %peer, "Peer gone before sync response");
            return;
        };
        send(&handle, &Message::PeerSyncResponse { id: self.id });
        self.stream_data(peer, handle);
    }

    fn forward_merged<K, V>(
        &mut self,
        peer: PeerId,
        kind: MessageType,
        queue: Queue<K, V>,
        build: impl FnOnce(Queue<K, V>, Vec<PeerId>) -> Message,
    ) where
        K: Clone + Serialize,
        V: Clone + Serialize,
    {
        if queue.is_empty() || !self.first_sighting(kind, &queue) {
            return;
        }
        self.flood(&[peer], |ids| build(queue, ids));
    }

    /// Send the data map to `peer` in chunks, respecting backpressure.
    fn stream_data(&self, peer: PeerId, handle: SocketHandle) {
        let chunks = self.data.dump().chunks(self.config.sync_chunk_size);
        let ids = vec![self.id, peer];
        let weak = self.weak.clone();
        debug!(peer = %peer, chunks = chunks.len(), "Streaming data");
        tokio::spawn(async move {
            for queue in chunks {
                handle.drained().await;
                if handle.is_closed() {
                    debug!(peer = %peer, "Link closed during data stream");
                    return;
                }
                if !send(&handle, &Message::data_dump(queue, ids.clone())) {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().sync_streamed(peer, &handle);
            }
        });
    }

    fn sync_streamed(&mut self, peer: PeerId, handle: &SocketHandle) {
        if !self.peer_handle(peer).is_some_and(|current| current.same_as(handle)) {
            trace!(peer = %peer, "Data stream finished on a replaced link");
            return;
        }
        if let Some(progress) = self.sync_progress.get_mut(&peer) {
            progress.streamed = true;
        }
        self.check_sync_complete(peer);
    }

    pub(crate) fn handle_peer_sync_response(&mut self, peer: PeerId) {
        if let Some(progress) = self.sync_progress.get_mut(&peer) {
            progress.response = true;
        }
        self.check_sync_complete(peer);
    }

    fn check_sync_complete(&mut self, peer: PeerId) {
        let complete = self
            .sync_progress
            .get(&peer)
            .is_some_and(|progress| progress.response && progress.streamed);
        if !complete {
            return;
        }
        self.sync_progress.remove(&peer);
        if let Some(pending) = self.pending_syncs.remove(&peer) {
            let _ = pending.send(());
        }
        info!(peer = %peer, "Peer synced");
        self.emit(ServerEvent::PeerSync(peer));
    }
}
