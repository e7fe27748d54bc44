//! Awareness adapter: stable facade over the presence store.
//!
//! Binds one local user identity (an explicit `PeerId`) to the shared
//! presence map. Consumers read and write the local state through the
//! adapter and subscribe to "something in presence changed" without knowing
//! how states are stored or encoded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::events::{EventBus, Subscription};
use crate::peer_id::PeerId;
use crate::presence::{DecodeError, PresenceChange, PresenceStore, UserState};

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("invalid value for awareness field '{field}': {source}")]
    InvalidField {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Facade over a `PresenceStore` for one local peer.
pub struct Awareness {
    peer: PeerId,
    store: Arc<PresenceStore>,
    local_state: RwLock<Option<UserState>>,
    events: Arc<EventBus<PresenceChange>>,
    store_sub: Mutex<Option<Subscription<PresenceChange>>>,
    disposed: AtomicBool,
}

impl Awareness {
    /// Bind an adapter to a store under an explicit peer identity.
    pub fn new(peer: PeerId, store: Arc<PresenceStore>) -> Self {
        let events = Arc::new(EventBus::new());
        let forward = Arc::clone(&events);
        let store_sub = store.subscribe(move |change| forward.emit(change));

        Self {
            peer,
            store,
            local_state: RwLock::new(None),
            events,
            store_sub: Mutex::new(Some(store_sub)),
            disposed: AtomicBool::new(false),
        }
    }

    /// The identity local state is published under.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn store(&self) -> &Arc<PresenceStore> {
        &self.store
    }

    /// The local user's state, if one has been set.
    pub fn get_local_state(&self) -> Option<UserState> {
        self.local_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the local state and publish it to the store.
    pub fn set_local_state(&self, state: UserState) {
        if self.disposed.load(Ordering::Relaxed) {
            debug!(peer = %self.peer, "ignoring set_local_state on disposed adapter");
            return;
        }
        *self.local_state.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        // Publishing notifies subscribers through the store's change event.
        self.store.set(self.peer, state);
    }

    /// Update one field of the local state and publish the result.
    ///
    /// Fields the state models explicitly are type-checked; anything else
    /// lands in the open `extra` map untouched.
    pub fn set_local_state_field(
        &self,
        field: &str,
        value: Value,
    ) -> Result<(), AwarenessError> {
        let mut state = self.get_local_state().unwrap_or_default();

        let coerce = |field: &str, source: serde_json::Error| AwarenessError::InvalidField {
            field: field.to_string(),
            source,
        };

        match field {
            "name" => {
                state.name = serde_json::from_value(value).map_err(|e| coerce(field, e))?;
            }
            "color" => {
                state.color = serde_json::from_value(value).map_err(|e| coerce(field, e))?;
            }
            "focusing" => {
                state.focusing = serde_json::from_value(value).map_err(|e| coerce(field, e))?;
            }
            "anchorPos" => {
                state.anchor_pos = serde_json::from_value(value).map_err(|e| coerce(field, e))?;
            }
            "focusPos" => {
                state.focus_pos = serde_json::from_value(value).map_err(|e| coerce(field, e))?;
            }
            other => {
                state.extra.insert(other.to_string(), value);
            }
        }

        self.set_local_state(state);
        Ok(())
    }

    /// Every peer's state: remote entries from the store plus the local
    /// state under the local peer id. The store's copy of the local entry is
    /// skipped so the local user is never double-reported.
    pub fn get_states(&self) -> HashMap<PeerId, UserState> {
        let mut states = self.store.get_all_states();
        states.remove(&self.peer);
        if let Some(local) = self.get_local_state() {
            states.insert(self.peer, local);
        }
        states
    }

    /// Encode the local contribution for broadcast, if one exists.
    pub fn encode_local_state(&self) -> Option<Vec<u8>> {
        self.get_local_state()
            .map(|state| PresenceStore::encode_state(self.peer, &state))
    }

    /// Merge a remote presence snapshot. Malformed bytes surface as a
    /// `DecodeError` the caller can log or count; nothing panics.
    pub fn decode_remote_state(&self, bytes: &[u8]) -> Result<Vec<PeerId>, DecodeError> {
        self.store.apply(bytes)
    }

    /// Subscribe to presence changes (local or remote). The handle
    /// unsubscribes on drop.
    pub fn on_update(
        &self,
        callback: impl Fn(PresenceChange) + Send + Sync + 'static,
    ) -> Subscription<PresenceChange> {
        self.events.subscribe(callback)
    }

    /// Tear the adapter down: stop forwarding store changes, drop all
    /// listeners, clear the local state. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::Relaxed) {
            return;
        }
        *self.store_sub.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.events.clear();
        *self.local_state.write().unwrap_or_else(|e| e.into_inner()) = None;
        debug!(peer = %self.peer, "awareness adapter disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("peer", &self.peer)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceOrigin;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn adapter() -> Awareness {
        Awareness::new(PeerId::from(1), Arc::new(PresenceStore::new()))
    }

    // ==================== Local state ====================

    #[test]
    fn test_local_state_starts_empty() {
        let aw = adapter();
        assert!(aw.get_local_state().is_none());
        assert!(aw.encode_local_state().is_none());
    }

    #[test]
    fn test_set_local_state_publishes_to_store() {
        let aw = adapter();
        aw.set_local_state(UserState::new("ada", "#ff0000"));

        assert_eq!(aw.get_local_state().unwrap().name, "ada");
        assert_eq!(aw.store().get(PeerId::from(1)).unwrap().name, "ada");
    }

    #[test]
    fn test_set_field_updates_known_fields() {
        let aw = adapter();
        aw.set_local_state(UserState::new("ada", "#ff0000"));

        aw.set_local_state_field("focusing", json!(true)).unwrap();
        aw.set_local_state_field("anchorPos", json!(12)).unwrap();
        aw.set_local_state_field("focusPos", json!(15)).unwrap();
        aw.set_local_state_field("name", json!("ada l")).unwrap();

        let state = aw.get_local_state().unwrap();
        assert!(state.focusing);
        assert_eq!(state.anchor_pos, Some(12));
        assert_eq!(state.focus_pos, Some(15));
        assert_eq!(state.name, "ada l");
    }

    #[test]
    fn test_set_field_null_clears_cursor() {
        let aw = adapter();
        aw.set_local_state_field("anchorPos", json!(3)).unwrap();
        aw.set_local_state_field("anchorPos", json!(null)).unwrap();
        assert_eq!(aw.get_local_state().unwrap().anchor_pos, None);
    }

    #[test]
    fn test_set_field_rejects_wrong_type() {
        let aw = adapter();
        let err = aw
            .set_local_state_field("focusing", json!("not a bool"))
            .unwrap_err();
        match err {
            AwarenessError::InvalidField { field, .. } => assert_eq!(field, "focusing"),
        }
    }

    #[test]
    fn test_set_field_unknown_goes_to_extra() {
        let aw = adapter();
        aw.set_local_state_field("avatar", json!("https://a.png"))
            .unwrap();
        assert_eq!(
            aw.get_local_state().unwrap().extra["avatar"],
            json!("https://a.png")
        );
    }

    #[test]
    fn test_set_field_without_prior_state_starts_from_default() {
        let aw = adapter();
        aw.set_local_state_field("name", json!("solo")).unwrap();
        let state = aw.get_local_state().unwrap();
        assert_eq!(state.name, "solo");
        assert_eq!(state.color, "");
    }

    // ==================== get_states merge ====================

    #[test]
    fn test_get_states_merges_local_and_remote() {
        let aw = adapter();
        aw.set_local_state(UserState::new("me", "#111111"));

        let remote = PresenceStore::new();
        remote.set(PeerId::from(2), UserState::new("them", "#222222"));
        aw.decode_remote_state(&remote.encode_all()).unwrap();

        let states = aw.get_states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[&PeerId::from(1)].name, "me");
        assert_eq!(states[&PeerId::from(2)].name, "them");
    }

    #[test]
    fn test_get_states_excludes_store_copy_of_self() {
        let aw = adapter();
        aw.set_local_state(UserState::new("fresh", "#111111"));

        // A remote snapshot may still carry a stale entry for this peer.
        let remote = PresenceStore::new();
        remote.set(PeerId::from(1), UserState::new("stale", "#999999"));
        remote.set(PeerId::from(2), UserState::new("them", "#222222"));
        aw.decode_remote_state(&remote.encode_all()).unwrap();

        let states = aw.get_states();
        assert_eq!(states.len(), 2);
        // Local truth wins over the store's copy of self.
        assert_eq!(states[&PeerId::from(1)].name, "fresh");
    }

    #[test]
    fn test_get_states_without_local_state() {
        let aw = adapter();
        let remote = PresenceStore::new();
        remote.set(PeerId::from(2), UserState::new("them", "#222222"));
        aw.decode_remote_state(&remote.encode_all()).unwrap();

        let states = aw.get_states();
        assert_eq!(states.len(), 1);
        assert!(!states.contains_key(&PeerId::from(1)));
    }

    // ==================== Encode / decode ====================

    #[test]
    fn test_encode_decode_between_adapters() {
        let a = Awareness::new(PeerId::from(1), Arc::new(PresenceStore::new()));
        let b = Awareness::new(PeerId::from(2), Arc::new(PresenceStore::new()));

        a.set_local_state(UserState::new("ada", "#ff0000"));
        let blob = a.encode_local_state().unwrap();
        let merged = b.decode_remote_state(&blob).unwrap();

        assert_eq!(merged, vec![PeerId::from(1)]);
        assert_eq!(b.get_states()[&PeerId::from(1)].name, "ada");
    }

    #[test]
    fn test_decode_malformed_is_error_not_panic() {
        let aw = adapter();
        aw.set_local_state(UserState::new("ada", "#ff0000"));

        assert!(aw.decode_remote_state(b"garbage").is_err());
        // Prior state survives the failed decode.
        assert_eq!(aw.get_states().len(), 1);
    }

    // ==================== Subscriptions ====================

    #[test]
    fn test_update_fires_for_local_and_remote_changes() {
        let aw = adapter();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let origins_clone = Arc::clone(&origins);
        let _sub = aw.on_update(move |change| {
            origins_clone.lock().unwrap().push(change.origin);
        });

        aw.set_local_state(UserState::new("ada", "#ff0000"));

        let remote = PresenceStore::new();
        remote.set(PeerId::from(2), UserState::new("them", "#222222"));
        aw.decode_remote_state(&remote.encode_all()).unwrap();

        let origins = origins.lock().unwrap();
        assert_eq!(
            origins.as_slice(),
            &[PresenceOrigin::Local, PresenceOrigin::Remote]
        );
    }

    #[test]
    fn test_dropped_subscription_stops_firing() {
        let aw = adapter();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = aw.on_update(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        aw.set_local_state(UserState::new("ada", "#ff0000"));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        drop(sub);
        aw.set_local_state(UserState::new("ada", "#00ff00"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    // ==================== Dispose ====================

    #[test]
    fn test_dispose_is_idempotent() {
        let aw = adapter();
        aw.set_local_state(UserState::new("ada", "#ff0000"));

        aw.dispose();
        aw.dispose();

        assert!(aw.is_disposed());
        assert!(aw.get_local_state().is_none());
    }

    #[test]
    fn test_dispose_clears_listeners_and_ignores_writes() {
        let aw = adapter();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = aw.on_update(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        aw.dispose();
        aw.set_local_state(UserState::new("ada", "#ff0000"));

        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(aw.get_local_state().is_none());
        // The disposed adapter no longer publishes to the store either.
        assert!(aw.store().get(PeerId::from(1)).is_none());
    }
}
