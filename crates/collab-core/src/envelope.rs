//! Relay frames exchanged between the sandboxed client and the host process.
//!
//! The relay channel carries JSON only, so binary payloads (CRDT updates,
//! presence snapshots) travel as plain number arrays and are rebuilt into
//! byte vectors on receipt. Envelope kinds are a closed union; the relay
//! boundary matches on them exhaustively instead of sniffing type strings.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed relay frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Transport connectivity as reported by the host.
///
/// Distinct from the document being synced: a socket can be connected while
/// the snapshot is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Payload of a `message` envelope: the document-level sub-protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncPayload {
    /// Incremental CRDT delta.
    Update { update: Vec<u8> },
    /// Full document export. Also serves as the snapshot-complete marker
    /// when answering `query-snapshot`.
    Snapshot { snapshot: Vec<u8> },
    /// Encoded presence blob.
    Ephemeral {
        ephemeral: Vec<u8>,
        #[serde(rename = "docId", default, skip_serializing_if = "Option::is_none")]
        doc_id: Option<String>,
    },
    /// Ask the server for a full snapshot.
    QuerySnapshot,
    /// Ask the server for the current presence set.
    QueryEphemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectData {
    #[serde(rename = "websocketUrl")]
    pub websocket_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// One envelope on the relay channel.
///
/// Every variant carries the adapter id it is addressed to; routing by that
/// id is the provider's job, the channel itself is adapter-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayEnvelope {
    /// Ask the host to open the document's transport.
    Connect {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        data: ConnectData,
    },
    /// Ask the host to tear the transport down.
    Disconnect {
        #[serde(rename = "adapterId")]
        adapter_id: String,
    },
    /// Document or presence traffic, in either direction.
    Message {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        data: SyncPayload,
    },
    /// Host-reported connectivity change.
    Status {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        data: StatusData,
    },
    /// Host-reported failure. Informational; providers stay connectable.
    Error {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        data: ErrorData,
    },
}

impl RelayEnvelope {
    /// The adapter id this envelope is addressed to.
    pub fn adapter_id(&self) -> &str {
        match self {
            RelayEnvelope::Connect { adapter_id, .. }
            | RelayEnvelope::Disconnect { adapter_id }
            | RelayEnvelope::Message { adapter_id, .. }
            | RelayEnvelope::Status { adapter_id, .. }
            | RelayEnvelope::Error { adapter_id, .. } => adapter_id,
        }
    }
}

/// Wire unit of the relay channel: an envelope plus the optional correlation
/// id used by request/response calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub envelope: RelayEnvelope,
}

impl RelayFrame {
    pub fn new(envelope: RelayEnvelope) -> Self {
        Self {
            request_id: None,
            envelope,
        }
    }

    pub fn with_request_id(envelope: RelayEnvelope, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            envelope,
        }
    }

    /// Serialize to JSON bytes for the channel.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RelayFrame serialization should not fail")
    }

    /// Parse a frame from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Serialization shapes ====================

    #[test]
    fn test_connect_envelope_shape() {
        let frame = RelayFrame::new(RelayEnvelope::Connect {
            adapter_id: "loro-doc1".into(),
            data: ConnectData {
                websocket_url: "ws://localhost:9480".into(),
            },
        });

        let json = String::from_utf8(frame.to_json()).unwrap();
        assert!(json.contains("\"type\":\"connect\""));
        assert!(json.contains("\"adapterId\":\"loro-doc1\""));
        assert!(json.contains("\"websocketUrl\":\"ws://localhost:9480\""));
        assert!(!json.contains("requestId"));
    }

    #[test]
    fn test_update_payload_is_numeric_array() {
        let frame = RelayFrame::new(RelayEnvelope::Message {
            adapter_id: "loro-doc1".into(),
            data: SyncPayload::Update {
                update: vec![10, 20, 30],
            },
        });

        let json = String::from_utf8(frame.to_json()).unwrap();
        assert!(json.contains("\"update\":[10,20,30]"));
    }

    #[test]
    fn test_query_variants_use_kebab_tags() {
        let snap = serde_json::to_string(&SyncPayload::QuerySnapshot).unwrap();
        let eph = serde_json::to_string(&SyncPayload::QueryEphemeral).unwrap();
        assert_eq!(snap, "{\"type\":\"query-snapshot\"}");
        assert_eq!(eph, "{\"type\":\"query-ephemeral\"}");
    }

    #[test]
    fn test_status_values_are_lowercase() {
        let frame = RelayFrame::new(RelayEnvelope::Status {
            adapter_id: "loro-doc1".into(),
            data: StatusData {
                status: ConnectionStatus::Connected,
            },
        });

        let json = String::from_utf8(frame.to_json()).unwrap();
        assert!(json.contains("\"status\":\"connected\""));
    }

    #[test]
    fn test_request_id_serializes_when_present() {
        let frame = RelayFrame::with_request_id(
            RelayEnvelope::Message {
                adapter_id: "loro-doc1".into(),
                data: SyncPayload::QuerySnapshot,
            },
            "req-42",
        );

        let json = String::from_utf8(frame.to_json()).unwrap();
        assert!(json.contains("\"requestId\":\"req-42\""));
    }

    // ==================== Parsing ====================

    #[test]
    fn test_roundtrip_all_envelope_kinds() {
        let frames = vec![
            RelayFrame::new(RelayEnvelope::Connect {
                adapter_id: "loro-a".into(),
                data: ConnectData {
                    websocket_url: "ws://h:1".into(),
                },
            }),
            RelayFrame::new(RelayEnvelope::Disconnect {
                adapter_id: "loro-a".into(),
            }),
            RelayFrame::new(RelayEnvelope::Message {
                adapter_id: "loro-a".into(),
                data: SyncPayload::Ephemeral {
                    ephemeral: vec![1, 2],
                    doc_id: Some("a".into()),
                },
            }),
            RelayFrame::new(RelayEnvelope::Status {
                adapter_id: "loro-a".into(),
                data: StatusData {
                    status: ConnectionStatus::Disconnected,
                },
            }),
            RelayFrame::with_request_id(
                RelayEnvelope::Error {
                    adapter_id: "loro-a".into(),
                    data: ErrorData {
                        message: "boom".into(),
                    },
                },
                "r1",
            ),
        ];

        for frame in frames {
            let parsed = RelayFrame::from_json(&frame.to_json()).unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn test_parse_inbound_update_shape() {
        let json = br#"{"type":"message","adapterId":"loro-doc1","data":{"type":"update","update":[5,6,7]}}"#;
        let frame = RelayFrame::from_json(json).unwrap();
        assert_eq!(frame.envelope.adapter_id(), "loro-doc1");
        match frame.envelope {
            RelayEnvelope::Message {
                data: SyncPayload::Update { update },
                ..
            } => assert_eq!(update, vec![5, 6, 7]),
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_ephemeral_doc_id_optional() {
        let json =
            br#"{"type":"message","adapterId":"loro-x","data":{"type":"ephemeral","ephemeral":[9]}}"#;
        let frame = RelayFrame::from_json(json).unwrap();
        match frame.envelope {
            RelayEnvelope::Message {
                data: SyncPayload::Ephemeral { ephemeral, doc_id },
                ..
            } => {
                assert_eq!(ephemeral, vec![9]);
                assert_eq!(doc_id, None);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(RelayFrame::from_json(b"{").is_err());
        assert!(RelayFrame::from_json(b"{\"type\":\"mystery\"}").is_err());
        assert!(RelayFrame::from_json(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_adapter_id_accessor_covers_all_variants() {
        let envelopes = vec![
            RelayEnvelope::Connect {
                adapter_id: "a".into(),
                data: ConnectData {
                    websocket_url: "ws://h:1".into(),
                },
            },
            RelayEnvelope::Disconnect {
                adapter_id: "a".into(),
            },
            RelayEnvelope::Message {
                adapter_id: "a".into(),
                data: SyncPayload::QueryEphemeral,
            },
            RelayEnvelope::Status {
                adapter_id: "a".into(),
                data: StatusData {
                    status: ConnectionStatus::Connecting,
                },
            },
            RelayEnvelope::Error {
                adapter_id: "a".into(),
                data: ErrorData {
                    message: "m".into(),
                },
            },
        ];
        for envelope in envelopes {
            assert_eq!(envelope.adapter_id(), "a");
        }
    }
}
