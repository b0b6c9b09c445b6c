//! Protocol versioning for braid.
//!
//! Frames carry the protocol version in their header. Frames from clients
//! built before the header existed are recognised and answered with a fixed
//! pair of frames in the old encoding that tell the client to reload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 3, minor: 0 };

/// Status code sent to outdated clients.
pub const LEGACY_RELOAD_CODE: u16 = 426;

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// Frames sent to a client speaking an outdated codec.
///
/// Old clients decode bare MessagePack arrays of `[type, ...fields]`: the
/// first frame is a failed credentials response (type 2), the second a
/// reload instruction (type 0).
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn legacy_reload_frames() -> Result<[Bytes; 2], ProtocolError> {
    let credentials_failure = rmp_serde::to_vec(&(
        2u8,
        false,
        LEGACY_RELOAD_CODE,
        "Client is outdated, reload required",
    ))?;
    let reload = rmp_serde::to_vec(&(0u8, "reload"))?;
    Ok([Bytes::from(credentials_failure), Bytes::from(reload)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v3_0 = Version::new(3, 0);
        let v3_1 = Version::new(3, 1);
        let v2_0 = Version::new(2, 0);

        assert!(v3_0.is_compatible_with(&v3_1));
        assert!(v3_1.is_compatible_with(&v3_0));
        assert!(!v3_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_version_display() {
        let v = Version::new(1, 2);
        assert_eq!(v.to_string(), "1.2");
    }

    #[test]
    fn test_legacy_frames_are_fixed() {
        let first = legacy_reload_frames().unwrap();
        let second = legacy_reload_frames().unwrap();
        assert_eq!(first, second);
        // Bare MessagePack arrays, no braid frame header.
        assert_eq!(first[0][0], 0x94);
        assert_eq!(first[1][0], 0x92);
    }
}
