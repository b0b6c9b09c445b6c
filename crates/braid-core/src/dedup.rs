//! Content hashes for gossip deduplication.
//!
//! Flooded messages can reach a peer along several paths. Each peer keeps a
//! bounded set of recently seen content hashes and drops repeats.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;

/// Default number of hashes remembered.
pub const DEFAULT_CAPACITY: usize = 1024;

/// 64-bit content hash.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let b = hash.as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Hash the MessagePack encoding of a value.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn hash_serialized<T: Serialize + ?Sized>(value: &T) -> Result<u64, rmp_serde::encode::Error> {
    let bytes = rmp_serde::to_vec(value)?;
    Ok(hash64(&bytes))
}

/// Hash a JSON value by its canonical rendering.
#[must_use]
pub fn hash_value(value: &serde_json::Value) -> u64 {
    hash64(value.to_string().as_bytes())
}

/// Bounded set of recently seen hashes.
#[derive(Debug)]
pub struct RecentHashes {
    cache: LruCache<u64, ()>,
}

impl Default for RecentHashes {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecentHashes {
    /// Create a cache holding up to `capacity` hashes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Record a hash.
    ///
    /// Returns `true` if it was not seen recently.
    pub fn insert(&mut self, hash: u64) -> bool {
        if self.cache.get(&hash).is_some() {
            return false;
        }
        self.cache.put(hash, ());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_detects_repeats() {
        let mut recent = RecentHashes::new(2);
        assert!(recent.insert(1));
        assert!(!recent.insert(1));
        assert!(recent.insert(2));
        assert!(recent.insert(3));
        assert!(recent.insert(1), "oldest hash evicted");
    }

    #[test]
    fn test_repeat_refreshes_entry() {
        let mut recent = RecentHashes::new(2);
        recent.insert(1);
        recent.insert(2);
        assert!(!recent.insert(1));
        recent.insert(3);
        assert!(!recent.insert(1));
        assert!(recent.insert(2));
    }

    #[test]
    fn test_hashes() {
        assert_eq!(hash64(b"abc"), hash64(b"abc"));
        assert_ne!(hash64(b"abc"), hash64(b"abd"));
        assert_eq!(hash_value(&json!({"a": 1})), hash_value(&json!({"a": 1})));
        assert_ne!(hash_value(&json!(1)), hash_value(&json!("1")));
        assert_eq!(
            hash_serialized(&("k", 1u8)).unwrap(),
            hash_serialized(&("k", 1u8)).unwrap()
        );
    }
}
