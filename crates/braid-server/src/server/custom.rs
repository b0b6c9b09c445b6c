//! Named application maps and sets.
//!
//! Replicated across the mesh like the data map, but never delivered to
//! sockets. Changes surface as [`ServerEvent::CustomMapChange`] and
//! [`ServerEvent::CustomSetChange`].

use braid_core::crdt::{Change, SetChange};
use braid_core::{ObservedRemoveMap, ObservedRemoveSet};
use braid_protocol::SetValue;
use serde_json::Value;
use std::sync::Arc;

use super::state::State;
use super::{Inner, Server};
use crate::events::ServerEvent;

impl State {
    pub(crate) fn custom_map(&mut self, name: &str) -> &mut ObservedRemoveMap<String, Value> {
        let (replica, max_age) = (self.id.0, self.config.tombstone_max_age);
        self.custom_maps
            .entry(name.to_string())
            .or_insert_with(|| ObservedRemoveMap::with_max_age(replica, max_age))
    }

    pub(crate) fn custom_set(&mut self, name: &str) -> &mut ObservedRemoveSet<SetValue> {
        let (replica, max_age) = (self.id.0, self.config.tombstone_max_age);
        self.custom_sets
            .entry(name.to_string())
            .or_insert_with(|| ObservedRemoveSet::with_max_age(replica, max_age))
    }

    pub(crate) fn emit_custom_map_change(&self, name: &str, change: Change<String, Value>) {
        let (key, value) = match change {
            Change::Set { key, value, .. } => (key, Some(value)),
            Change::Delete { key, .. } => (key, None),
        };
        self.emit(ServerEvent::CustomMapChange {
            name: name.to_string(),
            key,
            value,
        });
    }

    pub(crate) fn emit_custom_set_change(&self, name: &str, change: SetChange<SetValue>) {
        let (value, added) = match change {
            SetChange::Add(SetValue(value)) => (value, true),
            SetChange::Delete(SetValue(value)) => (value, false),
        };
        self.emit(ServerEvent::CustomSetChange {
            name: name.to_string(),
            value,
            added,
        });
    }
}

impl Server {
    /// Handle to the replicated map `name`, created on first use.
    #[must_use]
    pub fn get_map(&self, name: &str) -> CustomMap {
        self.inner.state.lock().custom_map(name);
        CustomMap {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }
    }

    /// Handle to the replicated set `name`, created on first use.
    #[must_use]
    pub fn get_set(&self, name: &str) -> CustomSet {
        self.inner.state.lock().custom_set(name);
        CustomSet {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }
    }
}

/// A named replicated map.
#[derive(Clone)]
pub struct CustomMap {
    inner: Arc<Inner>,
    name: String,
}

impl std::fmt::Debug for CustomMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomMap").field("name", &self.name).finish()
    }
}

impl CustomMap {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut state = self.inner.state.lock();
        let update = state.custom_map(&self.name).set(key.into(), value);
        if let Some(change) = update.change {
            state.emit_custom_map_change(&self.name, change);
        }
        state.publish_custom_map(&self.name, update.queue);
    }

    pub fn delete(&self, key: &str) {
        let mut state = self.inner.state.lock();
        let update = state.custom_map(&self.name).delete(&key.to_string());
        if let Some(change) = update.change {
            state.emit_custom_map_change(&self.name, change);
        }
        state.publish_custom_map(&self.name, update.queue);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.inner.state.lock();
        state.custom_map(&self.name).get(&key.to_string()).cloned()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.custom_map(&self.name).has(&key.to_string())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.inner.state.lock();
        let mut keys: Vec<String> = state.custom_map(&self.name).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A named replicated set of JSON values.
#[derive(Clone)]
pub struct CustomSet {
    inner: Arc<Inner>,
    name: String,
}

impl std::fmt::Debug for CustomSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomSet").field("name", &self.name).finish()
    }
}

impl CustomSet {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, value: Value) {
        let mut state = self.inner.state.lock();
        let update = state.custom_set(&self.name).add(SetValue(value));
        if let Some(change) = update.change {
            state.emit_custom_set_change(&self.name, change);
        }
        state.publish_custom_set(&self.name, update.queue);
    }

    pub fn delete(&self, value: &Value) {
        let mut state = self.inner.state.lock();
        let update = state
            .custom_set(&self.name)
            .delete(&SetValue(value.clone()));
        if let Some(change) = update.change {
            state.emit_custom_set_change(&self.name, change);
        }
        state.publish_custom_set(&self.name, update.queue);
    }

    #[must_use]
    pub fn has(&self, value: &Value) -> bool {
        let mut state = self.inner.state.lock();
        state.custom_set(&self.name).has(&SetValue(value.clone()))
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        let mut state = self.inner.state.lock();
        state
            .custom_set(&self.name)
            .values()
            .map(|value| value.0.clone())
            .collect()
    }
}
