//! Ephemeral presence: short-lived per-peer state (cursor, name, color).
//!
//! Presence is never persisted. Entries expire if not refreshed within the
//! store's TTL, which bounds memory growth from peers that disconnect without
//! a clean teardown. Remote snapshots are merged into the local map rather
//! than replacing it, so peers unknown to the sender survive an apply.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use web_time::Instant;

use crate::events::{EventBus, Subscription};
use crate::peer_id::PeerId;

/// How long a presence entry survives without being refreshed.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_millis(300_000);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed presence snapshot: {0}")]
    Presence(#[from] serde_json::Error),
}

/// Transient state one peer shares with the others.
///
/// `extra` captures awareness fields this crate does not model explicitly;
/// collaborating editors round-trip them untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub focusing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_pos: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_pos: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl UserState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            ..Default::default()
        }
    }
}

/// Where a presence mutation originated.
///
/// Providers forward only local-origin changes to the relay; rebroadcasting
/// remote-origin changes would echo every snapshot back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOrigin {
    Local,
    Remote,
}

/// Notification payload for presence subscribers.
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub origin: PresenceOrigin,
    /// Peers touched by this mutation.
    pub peers: Vec<PeerId>,
}

/// One record on the wire. A snapshot is a JSON array of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceRecord {
    peer: PeerId,
    state: UserState,
}

struct PresenceEntry {
    state: UserState,
    refreshed_at: Instant,
}

/// Store of every known peer's ephemeral state, keyed by peer id.
///
/// Thread-safe; share via `Arc`. Reads filter out entries older than the
/// TTL; writes and `prune_expired` drop them for good, so the map never
/// accumulates entries for peers that vanished without teardown.
pub struct PresenceStore {
    entries: RwLock<HashMap<PeerId, PresenceEntry>>,
    ttl: Duration,
    events: Arc<EventBus<PresenceChange>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PRESENCE_TTL)
    }

    /// Store with a custom TTL. Tests use short TTLs to observe expiry.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Overwrite one peer's contribution and notify subscribers.
    pub fn set(&self, peer: PeerId, state: UserState) {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                peer,
                PresenceEntry {
                    state,
                    refreshed_at: Instant::now(),
                },
            );
            // Writes are the reclamation point for lapsed entries; reads
            // only filter them out.
            entries.retain(|_, entry| entry.refreshed_at.elapsed() < self.ttl);
        }
        self.events.emit(PresenceChange {
            origin: PresenceOrigin::Local,
            peers: vec![peer],
        });
    }

    /// Drop one peer's contribution and notify subscribers.
    pub fn remove(&self, peer: PeerId) {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let removed = entries.remove(&peer).is_some();
            entries.retain(|_, entry| entry.refreshed_at.elapsed() < self.ttl);
            removed
        };
        if removed {
            self.events.emit(PresenceChange {
                origin: PresenceOrigin::Local,
                peers: vec![peer],
            });
        }
    }

    /// One peer's state, if present and not expired.
    pub fn get(&self, peer: PeerId) -> Option<UserState> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&peer)
            .filter(|entry| entry.refreshed_at.elapsed() < self.ttl)
            .map(|entry| entry.state.clone())
    }

    /// Every non-expired entry.
    pub fn get_all_states(&self) -> HashMap<PeerId, UserState> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(_, entry)| entry.refreshed_at.elapsed() < self.ttl)
            .map(|(peer, entry)| (*peer, entry.state.clone()))
            .collect()
    }

    /// Merge a remote snapshot into the local map.
    ///
    /// Peers named in the snapshot are overwritten and their expiry extended;
    /// peers absent from it are left alone. Returns the peers merged.
    pub fn apply(&self, bytes: &[u8]) -> Result<Vec<PeerId>, DecodeError> {
        let records: Vec<PresenceRecord> = serde_json::from_slice(bytes)?;
        let peers: Vec<PeerId> = records.iter().map(|r| r.peer).collect();

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            for record in records {
                entries.insert(
                    record.peer,
                    PresenceEntry {
                        state: record.state,
                        refreshed_at: Instant::now(),
                    },
                );
            }
            // Merged entries are fresh and survive; only lapsed ones go.
            entries.retain(|_, entry| entry.refreshed_at.elapsed() < self.ttl);
        }

        if !peers.is_empty() {
            self.events.emit(PresenceChange {
                origin: PresenceOrigin::Remote,
                peers: peers.clone(),
            });
        }
        Ok(peers)
    }

    /// Serialize every non-expired entry to a transmittable blob.
    pub fn encode_all(&self) -> Vec<u8> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let records: Vec<PresenceRecord> = entries
            .iter()
            .filter(|(_, entry)| entry.refreshed_at.elapsed() < self.ttl)
            .map(|(peer, entry)| PresenceRecord {
                peer: *peer,
                state: entry.state.clone(),
            })
            .collect();
        serde_json::to_vec(&records).expect("presence snapshot serialization should not fail")
    }

    /// Serialize a single peer's entry (the local contribution).
    pub fn encode_one(&self, peer: PeerId) -> Option<Vec<u8>> {
        let state = self.get(peer)?;
        Some(Self::encode_state(peer, &state))
    }

    /// Serialize one peer/state pair without touching any store.
    pub fn encode_state(peer: PeerId, state: &UserState) -> Vec<u8> {
        let records = vec![PresenceRecord {
            peer,
            state: state.clone(),
        }];
        serde_json::to_vec(&records).expect("presence snapshot serialization should not fail")
    }

    /// Drop entries past their TTL. Returns the peers dropped.
    pub fn prune_expired(&self) -> Vec<PeerId> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<PeerId> = entries
            .iter()
            .filter(|(_, entry)| entry.refreshed_at.elapsed() >= self.ttl)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            entries.remove(peer);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned expired presence entries");
        }
        expired
    }

    /// Subscribe to presence mutations. The handle unsubscribes on drop.
    pub fn subscribe(
        &self,
        callback: impl Fn(PresenceChange) + Send + Sync + 'static,
    ) -> Subscription<PresenceChange> {
        self.events.subscribe(callback)
    }

    pub fn len(&self) -> usize {
        self.get_all_states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}
