//! Provider election.
//!
//! For a key, every `(peer, pattern)` pair whose pattern matches the key is
//! a candidate. Candidates are sorted by peer id then pattern, and the
//! winner is `candidates[hash32(key) % len]`. The result depends only on the
//! candidate set and the key, so every replica computing it agrees.

use braid_protocol::PeerId;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Stable 32-bit hash of a key.
#[must_use]
pub fn hash32(key: &str) -> u32 {
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Pick the provider for `key` among `candidates`.
///
/// The input order does not matter.
#[must_use]
pub fn elect(key: &str, mut candidates: Vec<(PeerId, String)>) -> Option<(PeerId, String)> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort();
    candidates.dedup();
    let index = hash32(key) as usize % candidates.len();
    Some(candidates.swap_remove(index))
}

/// Compiled pattern cache.
///
/// Patterns arrive as strings from other peers; each is compiled once.
/// Invalid patterns are remembered and never match.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl PatternCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test a pattern against a key.
    pub fn is_match(&mut self, pattern: &str, key: &str) -> bool {
        self.get(pattern).is_some_and(|regex| regex.is_match(key))
    }

    /// Compiled regex for a pattern, `None` if it is invalid.
    pub fn get(&mut self, pattern: &str) -> Option<&Regex> {
        self.compiled
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid pattern");
                    None
                }
            })
            .as_ref()
    }

    /// All `(peer, pattern)` pairs matching `key`.
    pub fn candidates<'a, I>(&mut self, key: &str, registrations: I) -> Vec<(PeerId, String)>
    where
        I: IntoIterator<Item = (&'a PeerId, &'a Vec<String>)>,
    {
        let mut candidates = Vec::new();
        for (peer, patterns) in registrations {
            for pattern in patterns {
                if self.is_match(pattern, key) {
                    candidates.push((*peer, pattern.clone()));
                }
            }
        }
        candidates
    }

    /// Drop compiled patterns not in `keep`.
    pub fn retain<'a>(&mut self, keep: impl IntoIterator<Item = &'a String>) {
        let keep: std::collections::HashSet<&String> = keep.into_iter().collect();
        self.compiled.retain(|pattern, _| keep.contains(pattern));
    }

    /// Number of cached patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(peer: u64, pattern: &str) -> (PeerId, String) {
        (PeerId(peer), pattern.to_string())
    }

    #[test]
    fn test_hash32_is_stable() {
        assert_eq!(hash32("user:1"), hash32("user:1"));
        assert_ne!(hash32("user:1"), hash32("user:2"));
    }

    #[test]
    fn test_elect_ignores_input_order() {
        let forward = vec![pair(1, "a.*"), pair(2, "a.*"), pair(3, ".*")];
        let mut reversed = forward.clone();
        reversed.reverse();

        for key in ["a1", "a2", "abc", "a:b:c"] {
            assert_eq!(elect(key, forward.clone()), elect(key, reversed.clone()));
        }
        assert_eq!(elect("a", vec![]), None);
    }

    #[test]
    fn test_elect_spreads_keys() {
        let candidates = vec![pair(1, ".*"), pair(2, ".*")];
        let winners: std::collections::HashSet<PeerId> = (0..64)
            .filter_map(|i| elect(&format!("key{i}"), candidates.clone()))
            .map(|(peer, _)| peer)
            .collect();
        assert_eq!(winners.len(), 2);
    }

    #[test]
    fn test_pattern_cache() {
        let mut cache = PatternCache::new();
        assert!(cache.is_match("^user:", "user:1"));
        assert!(!cache.is_match("^user:", "item:1"));
        assert!(!cache.is_match("(", "anything"));
        assert_eq!(cache.len(), 2);

        let mut registrations = HashMap::new();
        registrations.insert(PeerId(1), vec!["^user:".to_string(), "^item:".to_string()]);
        registrations.insert(PeerId(2), vec![".*".to_string()]);
        let mut candidates = cache.candidates("user:1", registrations.iter());
        candidates.sort();
        assert_eq!(candidates, vec![pair(1, "^user:"), pair(2, ".*")]);

        let keep = vec!["^user:".to_string()];
        cache.retain(keep.iter());
        assert_eq!(cache.len(), 1);
    }
}
