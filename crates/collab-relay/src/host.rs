//! Client-side socket host: the other end of a provider's relay bridge.
//!
//! The host consumes a [`HostEndpoint`] and turns relay envelopes into
//! socket traffic. Each adapter that connects gets its own WebSocket to the
//! collaboration server; connectivity changes come back to the client as
//! `status` frames, document and presence traffic as `message` frames.
//!
//! Sockets that drop are redialed with exponential backoff until the
//! adapter disconnects or the attempt budget is exhausted.

use crate::protocol::{WireMessage, PROTOCOL_VERSION};
use crate::reconnect::{now_ms, ReconnectConfig, ReconnectState};
use crate::socket::{ClientSocket, SocketEvent};
use collab_core::envelope::{ErrorData, StatusData};
use collab_core::provider::ADAPTER_PREFIX;
use collab_core::relay::HostEndpoint;
use collab_core::{ConnectionStatus, PeerId, RelayEnvelope, RelayFrame, SyncPayload};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, trace, warn};

/// How often the host checks for due reconnect attempts.
const RECONNECT_TICK: Duration = Duration::from_millis(500);

/// Per-adapter connection state.
struct AdapterState {
    websocket_url: String,
    doc_id: String,
    connected: bool,
}

/// Bridges relay envelopes to WebSocket connections, one per adapter.
pub struct SocketHost {
    peer: PeerId,
    from_client: mpsc::UnboundedReceiver<RelayFrame>,
    to_client: mpsc::UnboundedSender<RelayFrame>,
    config: ReconnectConfig,
    /// Live sockets keyed by adapter id
    sockets: HashMap<String, ClientSocket>,
    /// Adapters that asked to connect, keyed by adapter id
    adapters: HashMap<String, AdapterState>,
    /// Backoff state for adapters whose socket dropped
    reconnecting: HashMap<String, ReconnectState>,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketHost {
    pub fn new(peer: PeerId, endpoint: HostEndpoint, config: ReconnectConfig) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        Self {
            peer,
            from_client: endpoint.from_client,
            to_client: endpoint.to_client,
            config,
            sockets: HashMap::new(),
            adapters: HashMap::new(),
            reconnecting: HashMap::new(),
            socket_tx,
            socket_rx,
        }
    }

    /// Drive the host until the client side of the bridge goes away.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(RECONNECT_TICK);
        loop {
            tokio::select! {
                frame = self.from_client.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => {
                            debug!("client endpoint closed, stopping host");
                            break;
                        }
                    }
                }
                Some(event) = self.socket_rx.recv() => {
                    self.handle_socket_event(event).await;
                }
                _ = tick.tick() => {
                    self.process_reconnects().await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: RelayFrame) {
        match frame.envelope {
            RelayEnvelope::Connect { adapter_id, data } => {
                self.open_adapter(adapter_id, data.websocket_url).await;
            }
            RelayEnvelope::Disconnect { adapter_id } => {
                self.close_adapter(&adapter_id).await;
            }
            RelayEnvelope::Message { adapter_id, data } => {
                self.forward_payload(&adapter_id, data).await;
            }
            // Host-originated kinds; nothing to do with an echo.
            RelayEnvelope::Status { .. } | RelayEnvelope::Error { .. } => {}
        }
    }

    async fn open_adapter(&mut self, adapter_id: String, websocket_url: String) {
        if self.sockets.contains_key(&adapter_id) {
            // Already dialing or connected; just restate where we are.
            let connected = self
                .adapters
                .get(&adapter_id)
                .map(|state| state.connected)
                .unwrap_or(false);
            let status = if connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Connecting
            };
            self.push_status(&adapter_id, status);
            return;
        }

        let doc_id = adapter_id
            .strip_prefix(ADAPTER_PREFIX)
            .unwrap_or(&adapter_id)
            .to_string();
        info!("opening transport for {} ({})", adapter_id, websocket_url);
        self.adapters.insert(
            adapter_id.clone(),
            AdapterState {
                websocket_url,
                doc_id,
                connected: false,
            },
        );
        self.reconnecting.remove(&adapter_id);
        self.push_status(&adapter_id, ConnectionStatus::Connecting);
        self.dial(&adapter_id).await;
    }

    async fn close_adapter(&mut self, adapter_id: &str) {
        info!("closing transport for {}", adapter_id);
        self.adapters.remove(adapter_id);
        self.reconnecting.remove(adapter_id);
        if let Some(mut socket) = self.sockets.remove(adapter_id) {
            socket.close().await;
        }
        self.push_status(adapter_id, ConnectionStatus::Disconnected);
    }

    /// Translate a client payload into a wire message for the adapter's
    /// socket. Payloads for offline adapters are dropped; CRDT catch-up on
    /// reconnect covers the gap.
    async fn forward_payload(&mut self, adapter_id: &str, payload: SyncPayload) {
        let Some(state) = self.adapters.get(adapter_id) else {
            debug!("payload for unknown adapter {}", adapter_id);
            return;
        };
        let doc_id = state.doc_id.clone();
        let message = match payload {
            SyncPayload::Update { update } => WireMessage::Update { doc_id, update },
            SyncPayload::Snapshot { snapshot } => WireMessage::Snapshot { doc_id, snapshot },
            SyncPayload::Ephemeral {
                ephemeral,
                doc_id: payload_doc,
            } => WireMessage::Ephemeral {
                doc_id: payload_doc.unwrap_or(doc_id),
                ephemeral,
            },
            SyncPayload::QuerySnapshot => WireMessage::QuerySnapshot { doc_id },
            SyncPayload::QueryEphemeral => WireMessage::QueryEphemeral { doc_id },
        };

        let Some(socket) = self.sockets.get(adapter_id) else {
            debug!("dropping payload for offline adapter {}", adapter_id);
            return;
        };
        let encoded = match message.to_binary() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode frame for {}: {}", adapter_id, e);
                return;
            }
        };
        if let Err(e) = socket.send(&encoded).await {
            warn!("failed to send frame for {}: {}", adapter_id, e);
            self.push_error(adapter_id, &format!("send failed: {e}"));
        }
    }

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Hello {
                conn_id,
                peer_id,
                role,
                version,
            } => self.handle_hello(conn_id, peer_id, role, version).await,
            SocketEvent::Message { conn_id, data } => self.handle_wire_message(conn_id, data),
            SocketEvent::Closed { conn_id } => self.handle_socket_closed(conn_id),
        }
    }

    async fn handle_hello(
        &mut self,
        adapter_id: String,
        peer_id: String,
        role: String,
        version: u32,
    ) {
        if version != PROTOCOL_VERSION {
            warn!(
                "server for {} speaks protocol version {} != {}, giving up",
                adapter_id, version, PROTOCOL_VERSION
            );
            if let Some(mut socket) = self.sockets.remove(&adapter_id) {
                socket.close().await;
            }
            // The version will not change on retry; stop here.
            self.reconnecting.remove(&adapter_id);
            self.push_error(
                &adapter_id,
                &format!("protocol version mismatch: server speaks {version}"),
            );
            self.push_status(&adapter_id, ConnectionStatus::Disconnected);
            return;
        }

        debug!("{} hello for {} (peer {})", role, adapter_id, peer_id);
        if let Some(socket) = self.sockets.get_mut(&adapter_id) {
            socket.remote_peer = Some(peer_id);
        }
        if let Some(state) = self.adapters.get_mut(&adapter_id) {
            state.connected = true;
        }
        self.reconnecting.remove(&adapter_id);
        self.push_status(&adapter_id, ConnectionStatus::Connected);
    }

    fn handle_wire_message(&mut self, adapter_id: String, data: Vec<u8>) {
        let message = match WireMessage::from_binary(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable frame for {}: {}", adapter_id, e);
                return;
            }
        };
        let payload = match message {
            WireMessage::Update { update, .. } => SyncPayload::Update { update },
            WireMessage::Snapshot { snapshot, .. } => SyncPayload::Snapshot { snapshot },
            WireMessage::Ephemeral { doc_id, ephemeral } => SyncPayload::Ephemeral {
                ephemeral,
                doc_id: Some(doc_id),
            },
            WireMessage::QuerySnapshot { .. } | WireMessage::QueryEphemeral { .. } => {
                trace!("ignoring query from server for {}", adapter_id);
                return;
            }
        };
        self.push_frame(RelayEnvelope::Message {
            adapter_id,
            data: payload,
        });
    }

    fn handle_socket_closed(&mut self, adapter_id: String) {
        self.sockets.remove(&adapter_id);
        let Some(state) = self.adapters.get_mut(&adapter_id) else {
            // Closed on purpose via disconnect.
            return;
        };
        state.connected = false;
        self.push_status(&adapter_id, ConnectionStatus::Disconnected);
        self.schedule_reconnect(&adapter_id);
    }

    async fn dial(&mut self, adapter_id: &str) {
        let Some(state) = self.adapters.get(adapter_id) else {
            return;
        };
        let url = state.websocket_url.clone();
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                let socket =
                    ClientSocket::new(adapter_id.to_string(), ws_stream, self.socket_tx.clone());
                if let Err(e) = socket.send_hello(self.peer, "client").await {
                    warn!("failed to send hello for {}: {}", adapter_id, e);
                    self.push_status(adapter_id, ConnectionStatus::Disconnected);
                    self.schedule_reconnect(adapter_id);
                    return;
                }
                self.sockets.insert(adapter_id.to_string(), socket);
                self.reconnecting.remove(adapter_id);
                // Connected is pushed once the server's hello arrives.
            }
            Err(e) => {
                warn!("failed to dial {} for {}: {}", url, adapter_id, e);
                self.push_status(adapter_id, ConnectionStatus::Disconnected);
                self.schedule_reconnect(adapter_id);
            }
        }
    }

    fn schedule_reconnect(&mut self, adapter_id: &str) {
        if !self.adapters.contains_key(adapter_id) {
            return;
        }
        let (exhausted, delay, attempts) = {
            let state = self
                .reconnecting
                .entry(adapter_id.to_string())
                .or_default();
            state.schedule(now_ms(), &self.config);
            (
                state.exceeded_max_attempts(&self.config),
                state.current_delay,
                state.attempts,
            )
        };
        if exhausted {
            warn!("reconnect attempts exhausted for {}", adapter_id);
            self.reconnecting.remove(adapter_id);
            self.push_error(adapter_id, "reconnect attempts exhausted");
            return;
        }
        info!(
            "scheduled reconnect for {} in {:?} (attempt {})",
            adapter_id, delay, attempts
        );
    }

    async fn process_reconnects(&mut self) {
        let now = now_ms();
        let due: Vec<String> = self
            .reconnecting
            .iter()
            .filter(|(_, state)| state.is_due(now))
            .map(|(adapter_id, _)| adapter_id.clone())
            .collect();
        for adapter_id in due {
            if !self.adapters.contains_key(&adapter_id) {
                self.reconnecting.remove(&adapter_id);
                continue;
            }
            info!("reattempting connection for {}", adapter_id);
            self.push_status(&adapter_id, ConnectionStatus::Connecting);
            self.dial(&adapter_id).await;
        }
    }

    fn push_frame(&self, envelope: RelayEnvelope) {
        let _ = self.to_client.send(RelayFrame::new(envelope));
    }

    fn push_status(&self, adapter_id: &str, status: ConnectionStatus) {
        self.push_frame(RelayEnvelope::Status {
            adapter_id: adapter_id.to_string(),
            data: StatusData { status },
        });
    }

    fn push_error(&self, adapter_id: &str, message: &str) {
        self.push_frame(RelayEnvelope::Error {
            adapter_id: adapter_id.to_string(),
            data: ErrorData {
                message: message.to_string(),
            },
        });
    }
}
