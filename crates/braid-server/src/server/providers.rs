//! Provider election.
//!
//! Every key with a subscriber somewhere in the mesh gets exactly one active
//! provider, elected deterministically from all `(peer, pattern)` pairs
//! matching the key. Every peer runs the same election on the same
//! replicated input, so concurrent elections agree.
//!
//! The local provider role per key is a two-state machine reported through
//! the provide callback. Losing the role can be debounced per pattern.

use braid_core::elect;
use braid_protocol::PeerId;
use tracing::{debug, trace, warn};

use super::state::State;

impl State {
    /// Write `providers[self]` from the local registrations.
    pub(crate) fn publish_own_providers(&mut self) {
        let mut patterns: Vec<String> = self.local_providers.keys().cloned().collect();
        patterns.sort();
        if patterns.is_empty() {
            if self.providers.has(&self.id) {
                let update = self.providers.delete(&self.id);
                self.publish_providers(update.queue);
            }
            return;
        }
        if self.providers.get(&self.id) == Some(&patterns) {
            return;
        }
        let update = self.providers.set(self.id, patterns);
        self.publish_providers(update.queue);
    }

    /// Whether any peer has a local subscriber for `key`.
    pub(crate) fn has_global_subscribers(&self, key: &str) -> bool {
        self.peer_subscriptions
            .values()
            .any(|(_, subscribed)| subscribed == key)
    }

    /// Re-run election or release for every key with subscribers or a
    /// provider.
    pub(crate) fn assign_all(&mut self) {
        let mut keys: Vec<String> = self
            .peer_subscriptions
            .values()
            .map(|(_, key)| key.clone())
            .chain(self.active_providers.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            self.subscribers_changed(&key);
        }
    }

    /// React to the mesh-wide subscriber set of `key` changing.
    pub(crate) fn subscribers_changed(&mut self, key: &str) {
        if self.has_global_subscribers(key) {
            self.expiring_keys.cancel(&key.to_string());
            self.assign_provider(key);
        } else {
            self.release_key(key);
        }
    }

    fn provider_is_valid(&mut self, key: &str, peer: PeerId, pattern: &str) -> bool {
        let present = peer == self.id || self.peers.has(&peer);
        let registered = self
            .providers
            .get(&peer)
            .is_some_and(|patterns| patterns.iter().any(|p| p == pattern));
        present && registered && self.patterns.is_match(pattern, key)
    }

    /// Keep a valid provider for `key` or elect a new one.
    pub(crate) fn assign_provider(&mut self, key: &str) {
        if !self.has_global_subscribers(key) {
            return;
        }
        let owned_key = key.to_string();
        let current = self.active_providers.get(&owned_key).cloned();
        if let Some((peer, pattern)) = &current {
            if self.provider_is_valid(key, *peer, pattern) {
                self.sync_local_provider(key);
                return;
            }
        }

        let id = self.id;
        let peers = &self.peers;
        let candidates = self.patterns.candidates(
            key,
            self.providers
                .iter()
                .filter(|(peer, _)| **peer == id || peers.has(peer)),
        );
        match elect(key, candidates) {
            Some(winner) => {
                if current.as_ref() != Some(&winner) {
                    debug!(key = %key, peer = %winner.0, pattern = %winner.1, "Elected provider");
                    let update = self.active_providers.set(owned_key, winner);
                    self.publish_active_providers(update.queue);
                }
            }
            None => {
                warn!(key = %key, "No provider matches key");
                if current.is_some() {
                    let update = self.active_providers.delete(&owned_key);
                    self.publish_active_providers(update.queue);
                }
            }
        }
        self.sync_local_provider(key);
    }

    /// Bring the local role for `key` in line with `active_providers`.
    pub(crate) fn sync_local_provider(&mut self, key: &str) {
        let owned_key = key.to_string();
        let elected = self
            .active_providers
            .get(&owned_key)
            .filter(|(peer, pattern)| *peer == self.id && self.local_providers.contains_key(pattern))
            .map(|(_, pattern)| pattern.clone());
        let active = self.active_local.get(key).cloned();

        match (active, elected) {
            (None, Some(pattern)) => self.activate_local(key, pattern),
            (Some(old), Some(new)) if old == new => {
                if self.deactivations.cancel(&owned_key) {
                    debug!(key = %key, "Provider deactivation cancelled");
                }
            }
            (Some(_), Some(new)) => {
                self.deactivations.cancel(&owned_key);
                self.finish_deactivation(key);
                self.activate_local(key, new);
            }
            (Some(pattern), None) => self.deactivate_local(key, &pattern),
            (None, None) => {}
        }
    }

    fn activate_local(&mut self, key: &str, pattern: String) {
        let Some(provider) = self.local_providers.get(&pattern) else {
            return;
        };
        debug!(key = %key, pattern = %pattern, "Providing key");
        let callback = provider.callback.clone();
        self.active_local.insert(key.to_string(), pattern);
        let key = key.to_string();
        self.defer(move || callback(&key, true));
    }

    fn deactivate_local(&mut self, key: &str, pattern: &str) {
        let owned_key = key.to_string();
        if self.deactivations.contains(&owned_key) {
            return;
        }
        let debounce = self
            .local_providers
            .get(pattern)
            .and_then(|provider| provider.debounce)
            .filter(|delay| !delay.is_zero());
        let Some(delay) = debounce else {
            self.finish_deactivation(key);
            return;
        };

        trace!(key = %key, delay_ms = delay.as_millis() as u64, "Debouncing provider deactivation");
        let generation = self.deactivations.next_generation();
        let timer_key = owned_key.clone();
        let handle = self.spawn_timer(delay, move |state| {
            if state.deactivations.take_if_current(&timer_key, generation) {
                state.finish_deactivation(&timer_key);
            }
        });
        self.deactivations.insert(owned_key, generation, handle);
    }

    fn finish_deactivation(&mut self, key: &str) {
        let Some(pattern) = self.active_local.remove(key) else {
            return;
        };
        debug!(key = %key, pattern = %pattern, "Stopped providing key");
        if let Some(provider) = self.local_providers.get(&pattern) {
            let callback = provider.callback.clone();
            let key = key.to_string();
            self.defer(move || callback(&key, false));
        }
    }

    /// Withdraw a provide registration.
    pub(crate) fn unprovide(&mut self, pattern: &str) -> bool {
        let Some(provider) = self.local_providers.remove(pattern) else {
            return false;
        };
        let keys: Vec<String> = self
            .active_local
            .iter()
            .filter(|(_, active)| active.as_str() == pattern)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.deactivations.cancel(&key);
            self.active_local.remove(&key);
            let callback = provider.callback.clone();
            self.defer(move || callback(&key, false));
        }
        self.publish_own_providers();
        self.assign_all();
        true
    }

    /// Drop the provider of a key nobody subscribes to any more.
    pub(crate) fn release_key(&mut self, key: &str) {
        let owned_key = key.to_string();
        if self.active_providers.has(&owned_key) {
            debug!(key = %key, "Releasing provider");
            let update = self.active_providers.delete(&owned_key);
            self.publish_active_providers(update.queue);
        }
        self.sync_local_provider(key);
        if self.data.has(&owned_key) {
            self.schedule_key_expiry(key);
        }
    }

    /// Delete `key` after the expiry window unless it gains a subscriber.
    pub(crate) fn schedule_key_expiry(&mut self, key: &str) {
        let owned_key = key.to_string();
        if self.expiring_keys.contains(&owned_key) {
            return;
        }
        let generation = self.expiring_keys.next_generation();
        let timer_key = owned_key.clone();
        let handle = self.spawn_timer(self.config.key_expiry, move |state| {
            if !state.expiring_keys.take_if_current(&timer_key, generation) {
                return;
            }
            if state.has_global_subscribers(&timer_key) {
                return;
            }
            debug!(key = %timer_key, "Expiring key");
            let update = state.data.delete(&timer_key);
            if !update.is_empty() {
                state.apply_local_data(update);
            }
        });
        self.expiring_keys.insert(owned_key, generation, handle);
    }
}

#[cfg(test)]
mod tests {
    use crate::server::{ProvideOptions, Server, ServerConfig};
    use braid_protocol::PeerId;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<(String, bool)>>>;

    fn server() -> Server {
        Server::new(ServerConfig {
            peer_id: Some(PeerId(7)),
            ..ServerConfig::default()
        })
    }

    fn recorder(calls: &Calls) -> impl Fn(&str, bool) + Send + Sync + 'static {
        let calls = calls.clone();
        move |key: &str, active: bool| calls.lock().unwrap().push((key.to_string(), active))
    }

    fn mark_subscribed(server: &Server, key: &str) {
        let mut state = server.inner.state.lock();
        let id = state.id;
        state.peer_subscriptions.add((id, key.to_string()));
        state.subscribers_changed(key);
    }

    fn mark_unsubscribed(server: &Server, key: &str) {
        let mut state = server.inner.state.lock();
        let id = state.id;
        state.peer_subscriptions.delete(&(id, key.to_string()));
        state.subscribers_changed(key);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_local_subscription_elects_local_provider() {
        let server = server();
        let calls = Calls::default();
        server
            .provide("^user:", recorder(&calls), ProvideOptions::default())
            .unwrap();

        mark_subscribed(&server, "user:1");
        settle().await;
        assert_eq!(
            server.active_provider("user:1"),
            Some((PeerId(7), "^user:".to_string()))
        );
        assert_eq!(*calls.lock().unwrap(), vec![("user:1".to_string(), true)]);

        mark_unsubscribed(&server, "user:1");
        settle().await;
        assert_eq!(server.active_provider("user:1"), None);
        assert_eq!(calls.lock().unwrap().last(), Some(&("user:1".to_string(), false)));
    }

    #[tokio::test]
    async fn test_unmatched_key_stays_unassigned() {
        let server = server();
        server
            .provide("^user:", |_, _| {}, ProvideOptions::default())
            .unwrap();
        mark_subscribed(&server, "order:1");
        assert_eq!(server.active_provider("order:1"), None);
    }

    #[tokio::test]
    async fn test_unprovide_deactivates() {
        let server = server();
        let calls = Calls::default();
        server
            .provide("^a", recorder(&calls), ProvideOptions::default())
            .unwrap();
        mark_subscribed(&server, "abc");
        assert!(server.unprovide("^a"));
        settle().await;
        assert_eq!(server.active_provider("abc"), None);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("abc".to_string(), true), ("abc".to_string(), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keeps_provider_across_resubscribe() {
        let server = server();
        let calls = Calls::default();
        server
            .provide(
                "^k",
                recorder(&calls),
                ProvideOptions {
                    debounce: Some(Duration::from_secs(5)),
                },
            )
            .unwrap();

        mark_subscribed(&server, "k1");
        mark_unsubscribed(&server, "k1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        mark_subscribed(&server, "k1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*calls.lock().unwrap(), vec![("k1".to_string(), true)]);

        mark_unsubscribed(&server, "k1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.lock().unwrap().last(), Some(&("k1".to_string(), false)));
        assert!(server.inner.state.lock().deactivations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_key_expires() {
        let server = Server::new(ServerConfig {
            peer_id: Some(PeerId(7)),
            key_expiry: Duration::from_secs(60),
            ..ServerConfig::default()
        });
        server.set("temp", serde_json::json!(1));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(server.has("temp"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!server.has("temp"));
    }
}
