//! Socket wire protocol between a client host and the collaboration server.
//!
//! The first frame in each direction is a JSON hello sent as a binary
//! WebSocket frame (UTF-8 bytes); every frame after that is a bincode
//! [`WireMessage`]. JSON objects start with `{` and bincode frames do not,
//! so the two are cheap to tell apart.

use collab_core::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire protocol version. Bumped on incompatible changes; peers with a
/// different version are refused at hello time.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (50MB) to prevent memory exhaustion from malicious
/// peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode wire message: {0}")]
    Encode(String),
    #[error("failed to decode wire message: {0}")]
    Decode(String),
}

/// Hello message exchanged when a socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Always "hello"
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The peer's identity, hex-encoded
    #[serde(rename = "peerId")]
    pub peer_id: String,

    /// Role in the connection: "server" or "client"
    pub role: String,

    /// Wire protocol version the peer speaks
    pub version: u32,
}

impl HelloMessage {
    pub fn new(peer: PeerId, role: &str) -> Self {
        Self {
            msg_type: "hello".to_string(),
            peer_id: peer.to_string(),
            role: role.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as a binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HelloMessage serialization should not fail")
    }

    /// Try to parse a hello from binary data.
    ///
    /// Returns None if the data is not UTF-8 JSON or not a hello message.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let msg: Self = serde_json::from_str(text).ok()?;
        if msg.msg_type == "hello" { Some(msg) } else { None }
    }

    /// Whether the advertised version can talk to this build.
    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Quick check if data looks like a JSON hello (starts with '{').
///
/// Bincode wire messages start with a little-endian variant index, never '{'.
pub fn is_likely_hello(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}

/// Messages exchanged after the hello, bincode-encoded.
///
/// Every variant names the document it concerns; the server keys its rooms
/// by that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Incremental CRDT delta for a document.
    Update { doc_id: String, update: Vec<u8> },

    /// Full document export. Sent by the server to answer `QuerySnapshot`.
    Snapshot { doc_id: String, snapshot: Vec<u8> },

    /// Encoded presence blob for a document's room.
    Ephemeral { doc_id: String, ephemeral: Vec<u8> },

    /// Ask the server for the room's full snapshot.
    QuerySnapshot { doc_id: String },

    /// Ask the server for the room's current presence set.
    QueryEphemeral { doc_id: String },
}

impl WireMessage {
    /// The document this message concerns.
    pub fn doc_id(&self) -> &str {
        match self {
            WireMessage::Update { doc_id, .. }
            | WireMessage::Snapshot { doc_id, .. }
            | WireMessage::Ephemeral { doc_id, .. }
            | WireMessage::QuerySnapshot { doc_id }
            | WireMessage::QueryEphemeral { doc_id } => doc_id,
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn from_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Hello handshake ====================

    #[test]
    fn test_hello_roundtrip() {
        let peer = PeerId::generate();
        let msg = HelloMessage::new(peer, "server");
        let parsed = HelloMessage::from_binary(&msg.to_binary()).unwrap();

        assert_eq!(parsed.msg_type, "hello");
        assert_eq!(parsed.peer_id, peer.to_string());
        assert_eq!(parsed.role, "server");
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert!(parsed.is_compatible());
    }

    #[test]
    fn test_hello_rejects_invalid_json() {
        assert!(HelloMessage::from_binary(b"not json at all").is_none());
    }

    #[test]
    fn test_hello_rejects_other_message_types() {
        let other = br#"{"type": "goodbye", "peerId": "x", "role": "client", "version": 1}"#;
        assert!(HelloMessage::from_binary(other).is_none());
    }

    #[test]
    fn test_hello_version_mismatch_detected() {
        let mut msg = HelloMessage::new(PeerId::generate(), "client");
        msg.version = PROTOCOL_VERSION + 1;
        assert!(!msg.is_compatible());
    }

    #[test]
    fn test_is_likely_hello_discriminates() {
        let hello = HelloMessage::new(PeerId::generate(), "client").to_binary();
        assert!(is_likely_hello(&hello));

        let wire = WireMessage::QuerySnapshot {
            doc_id: "doc1".to_string(),
        }
        .to_binary()
        .unwrap();
        assert!(!is_likely_hello(&wire));
    }

    // ==================== Wire messages ====================

    #[test]
    fn test_wire_message_roundtrip() {
        let msg = WireMessage::Update {
            doc_id: "notes/plan".to_string(),
            update: vec![1, 2, 3, 255],
        };
        let binary = msg.to_binary().unwrap();
        let parsed = WireMessage::from_binary(&binary).unwrap();

        match parsed {
            WireMessage::Update { doc_id, update } => {
                assert_eq!(doc_id, "notes/plan");
                assert_eq!(update, vec![1, 2, 3, 255]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_message_rejects_garbage() {
        assert!(WireMessage::from_binary(b"{json is not bincode}").is_err());
    }

    #[test]
    fn test_wire_message_doc_id_accessor() {
        let queries = [
            WireMessage::QuerySnapshot {
                doc_id: "a".to_string(),
            },
            WireMessage::QueryEphemeral {
                doc_id: "a".to_string(),
            },
            WireMessage::Ephemeral {
                doc_id: "a".to_string(),
                ephemeral: vec![],
            },
        ];
        for query in &queries {
            assert_eq!(query.doc_id(), "a");
        }
    }
}
