//! Transport provider: the per-document synchronization state machine.
//!
//! A `SyncProvider` owns one [`SharedDoc`] and one [`Awareness`] adapter and
//! shares a [`RelayBridge`] with every other provider in the process. It
//! translates local mutations into relay envelopes, applies inbound traffic
//! addressed to its adapter id, and derives the `synced` flag callers use to
//! tell "transport is up" apart from "replica has caught up".
//!
//! Connectivity is reported by the host through `status` envelopes, so the
//! provider never touches a socket itself. The state machine is:
//! disconnected, connecting after [`SyncProvider::connect`], connected but
//! unsynced once the host reports the transport open, and synced after the
//! first remote update or snapshot lands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace, warn};

use crate::awareness::Awareness;
use crate::document::{self, SharedDoc};
use crate::envelope::{ConnectData, ConnectionStatus, RelayEnvelope, RelayFrame, SyncPayload};
use crate::events::{EventBus, ProviderEvent, Subscription};
use crate::presence::{PresenceChange, PresenceOrigin, PresenceStore};
use crate::relay::{self, RelayBridge};

/// Prefix joining a document id into its relay adapter id.
pub const ADAPTER_PREFIX: &str = "loro-";

/// The relay adapter id a provider for `doc_id` answers to.
pub fn adapter_id_for_doc(doc_id: &str) -> String {
    format!("{ADAPTER_PREFIX}{doc_id}")
}

/// Synchronization provider for one logical document.
pub struct SyncProvider {
    adapter_id: String,
    websocket_url: String,
    doc: RwLock<Arc<SharedDoc>>,
    awareness: Arc<Awareness>,
    relay: Arc<RelayBridge>,
    events: Arc<EventBus<ProviderEvent>>,
    status: RwLock<ConnectionStatus>,
    synced: AtomicBool,
    relay_sub: Mutex<Option<Subscription<RelayFrame>>>,
    doc_sub: Mutex<Option<loro::Subscription>>,
    awareness_sub: Mutex<Option<Subscription<PresenceChange>>>,
}

impl SyncProvider {
    /// Wire a provider over a fresh presence store, publishing awareness
    /// under the document's peer identity.
    pub fn new(
        doc: SharedDoc,
        websocket_url: impl Into<String>,
        relay: Arc<RelayBridge>,
    ) -> Arc<Self> {
        let awareness = Arc::new(Awareness::new(doc.peer(), Arc::new(PresenceStore::new())));
        Self::with_awareness(doc, websocket_url, relay, awareness)
    }

    /// Wire a provider over a caller-supplied awareness adapter, for callers
    /// that need a custom presence TTL or a shared store.
    pub fn with_awareness(
        doc: SharedDoc,
        websocket_url: impl Into<String>,
        relay: Arc<RelayBridge>,
        awareness: Arc<Awareness>,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            adapter_id: adapter_id_for_doc(doc.doc_id()),
            websocket_url: websocket_url.into(),
            doc: RwLock::new(Arc::new(doc)),
            awareness,
            relay,
            events: Arc::new(EventBus::new()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            synced: AtomicBool::new(false),
            relay_sub: Mutex::new(None),
            doc_sub: Mutex::new(None),
            awareness_sub: Mutex::new(None),
        });
        provider.bind_doc_subscription();
        provider.bind_awareness_subscription();
        provider
    }

    /// The relay adapter id this provider answers to.
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// The logical document id.
    pub fn doc_id(&self) -> String {
        self.document().doc_id().to_string()
    }

    /// The current document handle. Replaced wholesale by
    /// [`SyncProvider::replace_document`]; listen for `Reload` to re-bind.
    pub fn document(&self) -> Arc<SharedDoc> {
        Arc::clone(&self.doc.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// The awareness adapter carrying presence for this document.
    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// Whether the local replica has caught up with the remote side since
    /// the transport last came up.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Last connectivity state reported by the host.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to provider events. The handle unsubscribes on drop.
    pub fn on(
        &self,
        callback: impl Fn(ProviderEvent) + Send + Sync + 'static,
    ) -> Subscription<ProviderEvent> {
        self.events.subscribe(callback)
    }

    /// Ask the host to open this document's transport and start consuming
    /// relay traffic. Safe to call again after [`SyncProvider::disconnect`];
    /// the relay listener is re-registered if it was dropped.
    pub fn connect(self: &Arc<Self>) -> relay::Result<()> {
        {
            let mut relay_sub = self.relay_sub.lock().unwrap_or_else(|e| e.into_inner());
            if relay_sub.is_none() {
                let weak = Arc::downgrade(self);
                *relay_sub = Some(self.relay.on(move |frame| {
                    if let Some(provider) = weak.upgrade() {
                        provider.handle_frame(frame);
                    }
                }));
            }
        }
        if self
            .doc_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            self.bind_doc_subscription();
        }
        self.set_status(ConnectionStatus::Connecting);
        self.relay.send(RelayEnvelope::Connect {
            adapter_id: self.adapter_id.clone(),
            data: ConnectData {
                websocket_url: self.websocket_url.clone(),
            },
        })
    }

    /// Tell the host to close the transport, stop consuming relay traffic,
    /// and dispose the awareness adapter. Safe to call when never connected.
    pub fn disconnect(&self) {
        let was_listening = self
            .relay_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if was_listening {
            if let Err(e) = self.relay.send(RelayEnvelope::Disconnect {
                adapter_id: self.adapter_id.clone(),
            }) {
                debug!(adapter_id = %self.adapter_id, "disconnect envelope not sent: {e}");
            }
        }
        if let Some(sub) = self.doc_sub.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sub.unsubscribe();
        }
        *self
            .awareness_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.awareness.dispose();
        if self.synced.swap(false, Ordering::SeqCst) {
            self.events.emit(ProviderEvent::Sync { synced: false });
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Swap in a document rebuilt from a full snapshot, keeping this
    /// provider's identity. The snapshot must embed the same document id.
    /// Emits `Reload` so bindings re-resolve their handles.
    pub fn replace_document(self: &Arc<Self>, snapshot: &[u8]) -> document::Result<()> {
        let (doc_id, peer) = {
            let current = self.document();
            (current.doc_id().to_string(), current.peer())
        };
        let replacement = SharedDoc::from_snapshot(&doc_id, peer, snapshot)?;
        *self.doc.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(replacement);
        self.bind_doc_subscription();
        self.events.emit(ProviderEvent::Reload { doc_id });
        Ok(())
    }

    /// Forward every committed local transaction to the relay. Local edits
    /// ship regardless of sync state; the CRDT keeps late merges safe.
    fn bind_doc_subscription(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let sub = self
            .document()
            .subscribe_local_update(Box::new(move |update| match weak.upgrade() {
                Some(provider) => {
                    provider.send_payload(SyncPayload::Update {
                        update: update.clone(),
                    });
                    true
                }
                None => false,
            }));
        let previous = self
            .doc_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(sub);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Forward locally-set presence to the relay. Remote-origin changes are
    /// not echoed back.
    fn bind_awareness_subscription(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let sub = self.awareness.on_update(move |change| {
            if change.origin != PresenceOrigin::Local {
                return;
            }
            if let Some(provider) = weak.upgrade() {
                provider.send_local_awareness();
            }
        });
        *self
            .awareness_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(sub);
    }

    fn handle_frame(&self, frame: RelayFrame) {
        // The relay channel carries every adapter's traffic.
        if frame.envelope.adapter_id() != self.adapter_id {
            return;
        }
        match frame.envelope {
            RelayEnvelope::Status { data, .. } => self.handle_status(data.status),
            RelayEnvelope::Message { data, .. } => self.handle_payload(data),
            RelayEnvelope::Error { data, .. } => {
                warn!(adapter_id = %self.adapter_id, "relay error: {}", data.message);
            }
            // Client-originated kinds; nothing for a provider to do.
            RelayEnvelope::Connect { .. } | RelayEnvelope::Disconnect { .. } => {}
        }
    }

    fn handle_status(&self, status: ConnectionStatus) {
        self.set_status(status);
        match status {
            ConnectionStatus::Connected => self.catch_up(),
            ConnectionStatus::Disconnected => {
                // The transport coming back up does not mean caught up; a
                // fresh snapshot or update has to land first.
                if self.synced.swap(false, Ordering::SeqCst) {
                    self.events.emit(ProviderEvent::Sync { synced: false });
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    /// Transport came up: ask for the authoritative snapshot and the
    /// presence of everyone already in the room, then announce ourselves.
    fn catch_up(&self) {
        self.send_payload(SyncPayload::QuerySnapshot);
        self.send_payload(SyncPayload::QueryEphemeral);
        self.send_local_awareness();
    }

    fn handle_payload(&self, payload: SyncPayload) {
        match payload {
            SyncPayload::Update { update } => self.apply_remote(&update),
            SyncPayload::Snapshot { snapshot } => {
                // Answer to query-snapshot. Edits made while offline are not
                // in the server's snapshot; push them back after merging.
                let pushback = self
                    .document()
                    .updates_absent_from(&snapshot)
                    .unwrap_or_else(|e| {
                        warn!(adapter_id = %self.adapter_id, "snapshot probe failed: {e}");
                        None
                    });
                self.apply_remote(&snapshot);
                if let Some(update) = pushback {
                    self.send_payload(SyncPayload::Update { update });
                }
            }
            SyncPayload::Ephemeral { ephemeral, .. } => {
                // Malformed presence is contained; document sync is unaffected.
                if let Err(e) = self.awareness.decode_remote_state(&ephemeral) {
                    warn!(adapter_id = %self.adapter_id, "presence decode failed: {e}");
                }
            }
            SyncPayload::QuerySnapshot | SyncPayload::QueryEphemeral => {
                // Queries are answered by the server side, never by a client.
                trace!(adapter_id = %self.adapter_id, "ignoring inbound query");
            }
        }
    }

    fn apply_remote(&self, bytes: &[u8]) {
        match self.document().import(bytes) {
            Ok(()) => {
                self.events.emit(ProviderEvent::Update {
                    update: bytes.to_vec(),
                });
                // First remote content since the transport came up marks the
                // replica caught up; notify only on the edge.
                if !self.synced.swap(true, Ordering::SeqCst) {
                    self.events.emit(ProviderEvent::Sync { synced: true });
                }
            }
            Err(e) => {
                warn!(adapter_id = %self.adapter_id, "remote import failed: {e}");
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            self.events.emit(ProviderEvent::Status { status });
        }
    }

    fn send_local_awareness(&self) {
        let Some(ephemeral) = self.awareness.encode_local_state() else {
            return;
        };
        self.send_payload(SyncPayload::Ephemeral {
            ephemeral,
            doc_id: Some(self.document().doc_id().to_string()),
        });
    }

    fn send_payload(&self, payload: SyncPayload) {
        let envelope = RelayEnvelope::Message {
            adapter_id: self.adapter_id.clone(),
            data: payload,
        };
        if let Err(e) = self.relay.send(envelope) {
            warn!(adapter_id = %self.adapter_id, "relay send failed: {e}");
        }
    }
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("adapter_id", &self.adapter_id)
            .field("status", &self.status())
            .field("synced", &self.synced())
            .finish()
    }
}
