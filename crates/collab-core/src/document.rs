//! SharedDoc: Loro document wrapper for one collaboratively edited document.
//!
//! Each document carries its identity in a `_meta` map written at creation.
//! Opening a document from snapshot bytes validates that embedded identity
//! against the id the caller expects, catching divergent-lineage documents
//! before they are wired to a provider.

use loro::{ExportMode, LoroDoc, LoroText, VersionVector};
use thiserror::Error;

use crate::peer_id::PeerId;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("document identity mismatch: expected '{expected}', found '{found}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("snapshot carries no document identity (expected '{expected}')")]
    MissingIdentity { expected: String },
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// One logical document as a Loro CRDT.
pub struct SharedDoc {
    doc: LoroDoc,
    doc_id: String,
    peer: PeerId,
}

impl SharedDoc {
    /// Create a new empty document with the given identity.
    ///
    /// The id is embedded in the document itself so replicas produced from
    /// this one share a verifiable lineage.
    pub fn new(doc_id: &str, peer: PeerId) -> Self {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer.as_u64()).ok();

        let meta = doc.get_map("_meta");
        meta.insert("doc_id", doc_id).ok();
        doc.commit();

        Self {
            doc,
            doc_id: doc_id.to_string(),
            peer,
        }
    }

    /// Open a document from snapshot bytes, validating its embedded identity.
    ///
    /// Importing happens before any local operation so the snapshot's history
    /// is preserved untouched; the local peer id only applies to edits made
    /// after this point.
    pub fn from_snapshot(doc_id: &str, peer: PeerId, bytes: &[u8]) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.import(bytes)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        doc.set_peer_id(peer.as_u64()).ok();

        let shared = Self {
            doc,
            doc_id: doc_id.to_string(),
            peer,
        };

        match shared.stored_doc_id() {
            Some(found) if found == doc_id => Ok(shared),
            Some(found) => Err(DocumentError::IdentityMismatch {
                expected: doc_id.to_string(),
                found,
            }),
            None => Err(DocumentError::MissingIdentity {
                expected: doc_id.to_string(),
            }),
        }
    }

    /// The identity this handle was opened under.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The peer id local edits are attributed to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The identity embedded in the document metadata, if any.
    pub fn stored_doc_id(&self) -> Option<String> {
        let meta = self.doc.get_map("_meta");
        let value = meta.get_deep_value();
        if let loro::LoroValue::Map(map) = value {
            if let Some(loro::LoroValue::String(s)) = map.get("doc_id") {
                return Some(s.to_string());
            }
        }
        None
    }

    /// The shared text body.
    pub fn text(&self) -> LoroText {
        self.doc.get_text("content")
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export the operations this document holds that a peer snapshot does
    /// not include. Returns `None` when the peer already has everything.
    ///
    /// Version vectors use causal ordering, so a peer that includes our
    /// oplog version has seen every operation we have.
    pub fn updates_absent_from(&self, snapshot: &[u8]) -> Result<Option<Vec<u8>>> {
        let probe = LoroDoc::new();
        probe
            .import(snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        let peer_version = probe.oplog_vv();
        if peer_version.includes_vv(&self.doc.oplog_vv()) {
            return Ok(None);
        }
        self.export_updates(&peer_version).map(Some)
    }

    /// Import a remote delta or snapshot. Importing the same bytes twice is
    /// a no-op by the CRDT merge property.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        self.doc
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(())
    }

    /// Subscribe to updates produced by local edits. The callback receives
    /// the encoded delta for each committed local transaction and returns
    /// whether to stay subscribed.
    pub fn subscribe_local_update(
        &self,
        callback: Box<dyn Fn(&Vec<u8>) -> bool + Send + Sync + 'static>,
    ) -> loro::Subscription {
        self.doc.subscribe_local_update(callback)
    }

    /// Commit pending changes
    pub fn commit(&self) {
        self.doc.commit();
    }
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("doc_id", &self.doc_id)
            .field("peer", &self.peer)
            .finish()
    }
}
