//! PeerId: unique identifier for a collaborating peer.
//!
//! Wraps a u64 internally (the id space Loro uses for replicas) but displays
//! as a 16-character hex string for logs and wire frames.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a collaborating peer.
///
/// One `PeerId` is held per synchronization client and stamped onto its
/// document handle, so every CRDT operation carries the same replica id that
/// presence entries are keyed by.
///
/// # Examples
/// ```
/// use collab_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// println!("{}", peer_id);  // "a1b2c3d4e5f67890"
///
/// let parsed: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value (for the Loro API).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id =
                u64::from_str_radix(&s.to_ascii_lowercase(), 16).map_err(PeerIdError::InvalidHex)?;
            return Ok(Self(id));
        }
        Err(PeerIdError::InvalidFormat)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(peer_id: PeerId) -> u64 {
        peer_id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
