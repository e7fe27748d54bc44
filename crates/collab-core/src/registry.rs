//! Document lifecycle: one provider per open document.
//!
//! The registry owns the doc-id → provider map for a client process. All
//! documents opened through one registry share its relay bridge and publish
//! presence under its peer identity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::document::{self, SharedDoc};
use crate::peer_id::PeerId;
use crate::provider::SyncProvider;
use crate::relay::RelayBridge;

/// Registry of live providers, keyed by document id.
pub struct ProviderRegistry {
    websocket_url: String,
    peer: PeerId,
    relay: Arc<RelayBridge>,
    providers: RwLock<HashMap<String, Arc<SyncProvider>>>,
}

impl ProviderRegistry {
    /// Build a registry with a freshly generated peer identity.
    pub fn new(websocket_url: impl Into<String>, relay: Arc<RelayBridge>) -> Self {
        Self::with_peer(websocket_url, relay, PeerId::generate())
    }

    /// Build a registry publishing under a caller-supplied identity.
    pub fn with_peer(
        websocket_url: impl Into<String>,
        relay: Arc<RelayBridge>,
        peer: PeerId,
    ) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            peer,
            relay,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// The identity every document opened here publishes presence under.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The provider for `doc_id`, if one is open.
    pub fn get(&self, doc_id: &str) -> Option<Arc<SyncProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .cloned()
    }

    /// The existing provider for `doc_id`, or a new one over an empty
    /// document. At most one provider per document id is ever live.
    pub fn get_or_create(&self, doc_id: &str) -> Arc<SyncProvider> {
        if let Some(existing) = self.get(doc_id) {
            return existing;
        }
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        // Re-check under the write lock; another caller may have won.
        if let Some(existing) = providers.get(doc_id) {
            return Arc::clone(existing);
        }
        info!(doc_id, "opening document");
        let doc = SharedDoc::new(doc_id, self.peer);
        let provider = SyncProvider::new(doc, self.websocket_url.clone(), Arc::clone(&self.relay));
        providers.insert(doc_id.to_string(), Arc::clone(&provider));
        provider
    }

    /// Open `doc_id` from snapshot bytes. The snapshot's embedded identity
    /// must match `doc_id`. If a provider is already live for the id, the
    /// snapshot replaces its document wholesale and `reload` fires.
    pub fn open_from_snapshot(
        &self,
        doc_id: &str,
        snapshot: &[u8],
    ) -> document::Result<Arc<SyncProvider>> {
        if let Some(existing) = self.get(doc_id) {
            existing.replace_document(snapshot)?;
            return Ok(existing);
        }
        let doc = SharedDoc::from_snapshot(doc_id, self.peer, snapshot)?;
        let provider = SyncProvider::new(doc, self.websocket_url.clone(), Arc::clone(&self.relay));
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        match providers.get(doc_id) {
            // Lost a race with get_or_create; fold the snapshot in.
            Some(existing) => {
                existing.replace_document(snapshot)?;
                Ok(Arc::clone(existing))
            }
            None => {
                info!(doc_id, "opening document from snapshot");
                providers.insert(doc_id.to_string(), Arc::clone(&provider));
                Ok(provider)
            }
        }
    }

    /// Disconnect and drop the provider for `doc_id`. Returns whether one
    /// was open.
    pub fn dispose(&self, doc_id: &str) -> bool {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(doc_id);
        match removed {
            Some(provider) => {
                debug!(doc_id, "disposing provider");
                provider.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect and drop every provider. Used at shutdown.
    pub fn dispose_all(&self) {
        let drained: Vec<_> = self
            .providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (doc_id, provider) in drained {
            debug!(doc_id, "disposing provider");
            provider.disconnect();
        }
    }

    /// Ids of every open document.
    pub fn doc_ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("peer", &self.peer)
            .field("open_docs", &self.len())
            .finish()
    }
}
