//! collab-relay library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the relay components,
//! allowing integration tests to access internal types.

pub mod host;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod socket;

// Re-export key types for convenience
pub use host::SocketHost;
pub use protocol::{HelloMessage, WireMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use reconnect::ReconnectConfig;
pub use server::CollabServer;
pub use socket::{ClientSocket, ServerSocket, Socket, SocketEvent};
