//! Bidirectional edge index.
//!
//! Tracks `source -> target` edges with lookups from either side. The
//! server uses it for socket/peer identity, socket/key subscriptions,
//! socket/published-key and socket/event-name relationships.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A directed graph indexed by both endpoints.
#[derive(Debug, Clone)]
pub struct DirectedGraphMap<S, T> {
    sources: HashMap<S, HashSet<T>>,
    targets: HashMap<T, HashSet<S>>,
}

impl<S, T> Default for DirectedGraphMap<S, T> {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
            targets: HashMap::new(),
        }
    }
}

impl<S, T> DirectedGraphMap<S, T>
where
    S: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
{
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge.
    ///
    /// Returns `true` if the edge is new.
    pub fn add_edge(&mut self, source: S, target: T) -> bool {
        let added = self
            .sources
            .entry(source.clone())
            .or_default()
            .insert(target.clone());
        self.targets.entry(target).or_default().insert(source);
        added
    }

    /// Remove an edge.
    ///
    /// Returns `true` if the edge existed.
    pub fn remove_edge(&mut self, source: &S, target: &T) -> bool {
        let removed = match self.sources.get_mut(source) {
            Some(targets) => {
                let removed = targets.remove(target);
                if targets.is_empty() {
                    self.sources.remove(source);
                }
                removed
            }
            None => false,
        };
        if let Some(sources) = self.targets.get_mut(target) {
            sources.remove(source);
            if sources.is_empty() {
                self.targets.remove(target);
            }
        }
        removed
    }

    /// Check if an edge exists.
    #[must_use]
    pub fn has_edge(&self, source: &S, target: &T) -> bool {
        self.sources
            .get(source)
            .is_some_and(|targets| targets.contains(target))
    }

    /// Check if a source has any edge.
    #[must_use]
    pub fn has_source(&self, source: &S) -> bool {
        self.sources.contains_key(source)
    }

    /// Check if a target has any edge.
    #[must_use]
    pub fn has_target(&self, target: &T) -> bool {
        self.targets.contains_key(target)
    }

    /// Targets reachable from a source.
    pub fn get_targets<'a>(&'a self, source: &S) -> impl Iterator<Item = &'a T> + 'a {
        self.sources.get(source).into_iter().flatten()
    }

    /// Sources pointing at a target.
    pub fn get_sources<'a>(&'a self, target: &T) -> impl Iterator<Item = &'a S> + 'a {
        self.targets.get(target).into_iter().flatten()
    }

    /// Remove a source and all its edges, returning the former targets.
    pub fn remove_source(&mut self, source: &S) -> Vec<T> {
        let Some(targets) = self.sources.remove(source) else {
            return Vec::new();
        };
        for target in &targets {
            if let Some(sources) = self.targets.get_mut(target) {
                sources.remove(source);
                if sources.is_empty() {
                    self.targets.remove(target);
                }
            }
        }
        targets.into_iter().collect()
    }

    /// Remove a target and all its edges, returning the former sources.
    pub fn remove_target(&mut self, target: &T) -> Vec<S> {
        let Some(sources) = self.targets.remove(target) else {
            return Vec::new();
        };
        for source in &sources {
            if let Some(targets) = self.sources.get_mut(source) {
                targets.remove(target);
                if targets.is_empty() {
                    self.sources.remove(source);
                }
            }
        }
        sources.into_iter().collect()
    }

    /// All sources with at least one edge.
    pub fn sources(&self) -> impl Iterator<Item = &S> {
        self.sources.keys()
    }

    /// All targets with at least one edge.
    pub fn targets(&self) -> impl Iterator<Item = &T> {
        self.targets.keys()
    }

    /// All edges.
    pub fn edges(&self) -> impl Iterator<Item = (&S, &T)> {
        self.sources
            .iter()
            .flat_map(|(source, targets)| targets.iter().map(move |target| (source, target)))
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.sources.values().map(HashSet::len).sum()
    }

    /// Whether the graph has no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
