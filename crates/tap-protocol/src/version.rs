//! Envelope versioning.
//!
//! Packets carry only the major version (`ver`) on the wire.

use serde::{Deserialize, Serialize};

/// Current envelope version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Envelope version information.
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

    /// Version announced by a packet's `ver` field.
    #[must_use]
    pub const fn from_wire(ver: u8) -> Self {
        Self { major: ver, minor: 0 }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Check whether a packet's `ver` field can be handled.
    ///
    /// Packets without a version are assumed current.
    #[must_use]
    pub fn accepts(&self, ver: Option<u8>) -> bool {
        ver.map_or(true, |v| self.is_compatible_with(&Self::from_wire(v)))
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
