//! Multipart containers for messages above the payload ceiling.
//!
//! An encoded frame larger than the configured maximum payload is cut into
//! [`Message::MultipartContainer`] chunks sharing a random id. The receiving
//! side collects chunks in a [`MultipartAssembler`] until every position has
//! arrived, then hands back the original frame. Assemblies that do not
//! complete within the timeout are dropped by [`MultipartAssembler::expire`].

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::codec::{self, ProtocolError};
use crate::messages::Message;

/// Bytes reserved for the container envelope around each chunk.
pub const MULTIPART_OVERHEAD: usize = 128;

/// Default time allowed for all chunks of a message to arrive.
pub const DEFAULT_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Split an encoded frame into encoded multipart container frames.
///
/// # Errors
///
/// Returns an error if a container fails to encode or the frame would need
/// more than `u32::MAX` chunks.
pub fn split(frame: &[u8], max_payload: usize) -> Result<Vec<Bytes>, ProtocolError> {
    let chunk_size = max_payload.saturating_sub(MULTIPART_OVERHEAD).max(1);
    let length = u32::try_from(frame.len().div_ceil(chunk_size))
        .map_err(|_| ProtocolError::Invalid("Too many multipart chunks".to_string()))?;
    let id: u64 = rand::random();

    frame
        .chunks(chunk_size)
        .enumerate()
        .map(|(position, data)| {
            codec::encode(&Message::MultipartContainer {
                id,
                position: position as u32,
                length,
                data: data.to_vec(),
            })
        })
        .collect()
}

/// Bounds on what an assembler keeps in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyLimits {
    /// Largest reassembled frame accepted.
    pub max_message_size: usize,
    /// Bytes that may sit in incomplete assemblies at once.
    pub max_pending_bytes: usize,
}

impl Default for AssemblyLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_bytes: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Default ceiling for a reassembled frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 400 * 1024 * 1024;

/// A partially received message.
#[derive(Debug)]
struct PendingMessage {
    length: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    size: usize,
    started: Instant,
}

/// Reassembles multipart containers from one sender into complete frames.
///
/// Chunks are stored as they arrive, so memory follows the bytes actually
/// received rather than the declared chunk count.
#[derive(Debug)]
pub struct MultipartAssembler {
    pending: HashMap<u64, PendingMessage>,
    pending_bytes: usize,
    limits: AssemblyLimits,
    timeout: Duration,
}

impl Default for MultipartAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_ASSEMBLY_TIMEOUT)
    }
}

impl MultipartAssembler {
    /// Create an assembler with the given completion timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_limits(timeout, AssemblyLimits::default())
    }

    /// Create an assembler with explicit memory bounds.
    #[must_use]
    pub fn with_limits(timeout: Duration, limits: AssemblyLimits) -> Self {
        Self {
            pending: HashMap::new(),
            pending_bytes: 0,
            limits,
            timeout,
        }
    }

    /// Add a chunk.
    ///
    /// Returns the complete frame once the last missing chunk arrives.
    /// Duplicate chunks are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk position or length is inconsistent, or
    /// if accepting it would exceed the assembly limits. An assembly that
    /// overflows its message size is discarded.
    pub fn push(
        &mut self,
        id: u64,
        position: u32,
        length: u32,
        data: Vec<u8>,
    ) -> Result<Option<Bytes>, ProtocolError> {
        if length == 0 || position >= length {
            return Err(ProtocolError::Invalid(format!(
                "Multipart chunk {position} out of range for length {length}"
            )));
        }
        if data.is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "Empty multipart chunk {position} of {id}"
            )));
        }
        // Every chunk carries at least one byte.
        if length as usize > self.limits.max_message_size {
            return Err(ProtocolError::TooLarge {
                size: length as usize,
                limit: self.limits.max_message_size,
            });
        }

        let pending = self.pending.entry(id).or_insert_with(|| PendingMessage {
            length,
            chunks: BTreeMap::new(),
            size: 0,
            started: Instant::now(),
        });
        if pending.length != length {
            return Err(ProtocolError::Invalid(format!(
                "Multipart length mismatch for {id}: {length} != {}",
                pending.length
            )));
        }
        if pending.chunks.contains_key(&position) {
            return Ok(None);
        }

        let size = pending.size + data.len();
        if size > self.limits.max_message_size {
            self.discard(id);
            return Err(ProtocolError::TooLarge {
                size,
                limit: self.limits.max_message_size,
            });
        }
        if self.pending_bytes + data.len() > self.limits.max_pending_bytes {
            if pending.chunks.is_empty() {
                self.pending.remove(&id);
            }
            return Err(ProtocolError::TooLarge {
                size: self.pending_bytes + data.len(),
                limit: self.limits.max_pending_bytes,
            });
        }

        self.pending_bytes += data.len();
        pending.size = size;
        pending.chunks.insert(position, data);
        if pending.chunks.len() < pending.length as usize {
            return Ok(None);
        }

        let Some(complete) = self.pending.remove(&id) else {
            return Ok(None);
        };
        self.pending_bytes -= complete.size;
        let mut buf = BytesMut::with_capacity(complete.size);
        for chunk in complete.chunks.into_values() {
            buf.extend_from_slice(&chunk);
        }
        Ok(Some(buf.freeze()))
    }

    fn discard(&mut self, id: u64) {
        if let Some(dropped) = self.pending.remove(&id) {
            self.pending_bytes -= dropped.size;
        }
    }

    /// Drop assemblies older than the timeout, returning their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.started) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.discard(*id);
        }
        expired
    }

    /// Number of incomplete messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no message is being assembled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes held by incomplete messages.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn containers(frames: &[Bytes]) -> Vec<(u64, u32, u32, Vec<u8>)> {
        frames
            .iter()
            .map(|frame| match codec::decode(frame).unwrap() {
                Message::MultipartContainer {
                    id,
                    position,
                    length,
                    data,
                } => (id, position, length, data),
                other => panic!("Expected container, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_split_and_reassemble_out_of_order() {
        let big = "x".repeat(10_000);
        let frame = codec::encode(&Message::publisher_message("k", json!(big))).unwrap();
        let parts = split(&frame, 1024).unwrap();
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= 1024));

        let mut chunks = containers(&parts);
        chunks.reverse();

        let mut assembler = MultipartAssembler::default();
        let mut result = None;
        for (id, position, length, data) in chunks {
            if let Some(done) = assembler.push(id, position, length, data).unwrap() {
                result = Some(done);
            }
        }
        assert_eq!(result.unwrap(), frame);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_duplicate_chunks_ignored() {
        let mut assembler = MultipartAssembler::default();
        assert!(assembler.push(1, 0, 2, vec![1]).unwrap().is_none());
        assert!(assembler.push(1, 0, 2, vec![9]).unwrap().is_none());
        let done = assembler.push(1, 1, 2, vec![2]).unwrap().unwrap();
        assert_eq!(&done[..], &[1, 2]);
    }

    #[test]
    fn test_invalid_chunks_rejected() {
        let mut assembler = MultipartAssembler::default();
        assert!(assembler.push(1, 2, 2, vec![]).is_err());
        assert!(assembler.push(1, 0, 0, vec![]).is_err());
        assert!(assembler.push(1, 0, 3, vec![]).is_err());
        assert!(assembler.push(1, 0, 3, vec![1]).unwrap().is_none());
        assert!(assembler.push(1, 1, 4, vec![2]).is_err());
    }

    #[test]
    fn test_expire_incomplete() {
        let mut assembler = MultipartAssembler::new(Duration::from_secs(60));
        assembler.push(7, 0, 3, vec![1]).unwrap();
        assert!(assembler.expire(Instant::now()).is_empty());

        let expired = assembler.expire(Instant::now() + Duration::from_secs(61));
        assert_eq!(expired, vec![7]);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_huge_declared_length_rejected_without_allocating() {
        let mut assembler = MultipartAssembler::default();
        let err = assembler.push(1, 0, u32::MAX, vec![1]).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { .. }), "{err}");
        assert!(assembler.is_empty());
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_oversized_assembly_discarded() {
        let limits = AssemblyLimits {
            max_message_size: 8,
            max_pending_bytes: 64,
        };
        let mut assembler = MultipartAssembler::with_limits(DEFAULT_ASSEMBLY_TIMEOUT, limits);
        assert!(assembler.push(1, 0, 3, vec![0; 5]).unwrap().is_none());
        assert!(assembler.push(1, 1, 3, vec![0; 5]).is_err());
        assert!(assembler.is_empty());
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_pending_bytes_capped_across_messages() {
        let limits = AssemblyLimits {
            max_message_size: 100,
            max_pending_bytes: 10,
        };
        let mut assembler = MultipartAssembler::with_limits(DEFAULT_ASSEMBLY_TIMEOUT, limits);
        assert!(assembler.push(1, 0, 2, vec![0; 6]).unwrap().is_none());
        assert!(assembler.push(2, 0, 2, vec![0; 6]).is_err());
        assert_eq!(assembler.len(), 1);

        let done = assembler.push(1, 1, 2, vec![1; 4]).unwrap().unwrap();
        assert_eq!(done.len(), 10);
        assert_eq!(assembler.pending_bytes(), 0);
        assert!(assembler.push(2, 0, 2, vec![0; 6]).unwrap().is_none());
    }
}
