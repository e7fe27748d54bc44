//! collab-core: client-side document synchronization over a message relay.
//!
//! This crate provides the core functionality for:
//! - Managing Loro documents with embedded identity
//! - Ephemeral presence with per-peer expiry and an awareness facade
//! - The per-document sync provider state machine
//! - A request/response bridge over a frame-based relay channel

pub mod awareness;
pub mod document;
pub mod envelope;
pub mod events;
pub mod peer_id;
pub mod presence;
pub mod provider;
pub mod registry;
pub mod relay;

pub use awareness::Awareness;
pub use document::{DocumentError, SharedDoc};
pub use envelope::{ConnectionStatus, RelayEnvelope, RelayFrame, SyncPayload};
pub use events::{EventBus, ProviderEvent, Subscription};
pub use peer_id::{PeerId, PeerIdError};
pub use presence::{PresenceChange, PresenceOrigin, PresenceStore, UserState};
pub use provider::SyncProvider;
pub use registry::ProviderRegistry;
pub use relay::{HostEndpoint, RelayBridge, RelayError};
