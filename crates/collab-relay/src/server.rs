//! Collaboration server: one room per document, relayed between clients.
//!
//! Each room keeps an authoritative document replica and a presence store.
//! Inbound updates are merged into the replica and fanned out to every other
//! room member; snapshot and presence queries are answered from room state,
//! so late joiners catch up without replaying history from peers.

use crate::protocol::{WireMessage, PROTOCOL_VERSION};
use crate::socket::{ServerSocket, SocketEvent};
use anyhow::Result;
use collab_core::{PeerId, PresenceStore};
use loro::{ExportMode, LoroDoc};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// One document's room: the authoritative replica plus its members.
struct Room {
    doc: LoroDoc,
    presence: PresenceStore,
    members: HashSet<String>,
}

impl Room {
    fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            presence: PresenceStore::new(),
            members: HashSet::new(),
        }
    }
}

/// WebSocket server relaying document rooms between clients.
pub struct CollabServer {
    peer: PeerId,
    /// Pre-hello connections indexed by conn id
    pending: HashMap<String, ServerSocket>,
    /// Post-hello clients indexed by conn id
    clients: HashMap<String, ServerSocket>,
    /// Rooms indexed by document id
    rooms: HashMap<String, Room>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    event_rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl CollabServer {
    pub fn new(peer: PeerId) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            peer,
            pending: HashMap::new(),
            clients: HashMap::new(),
            rooms: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("collaboration server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Number of clients past the hello.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Accept loop plus event dispatch. Runs until the process is stopped.
    pub async fn run(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// Upgrade a TCP connection to WebSocket and send our hello.
    ///
    /// The connection stays pending until the client's hello arrives.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without finishing the
                // WebSocket handshake; keep those out of the error log.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("connection closed before upgrade from {}", addr);
                } else {
                    error!("websocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;
        info!("new connection from {} ({})", addr, conn_id);

        let socket = ServerSocket::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        if let Err(e) = socket.send_hello(self.peer, "server").await {
            error!("failed to send hello to {}: {}", conn_id, e);
            return;
        }
        self.pending.insert(conn_id, socket);
    }

    pub async fn handle_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Hello {
                conn_id,
                peer_id,
                role,
                version,
            } => self.handle_hello(conn_id, peer_id, role, version).await,
            SocketEvent::Message { conn_id, data } => self.handle_message(conn_id, data).await,
            SocketEvent::Closed { conn_id } => self.handle_closed(conn_id),
        }
    }

    async fn handle_hello(
        &mut self,
        conn_id: String,
        peer_id: String,
        role: String,
        version: u32,
    ) {
        let Some(mut socket) = self.pending.remove(&conn_id) else {
            warn!("hello from unknown connection {}", conn_id);
            return;
        };
        if version != PROTOCOL_VERSION {
            warn!(
                "refusing {} (peer {}): protocol version {} != {}",
                conn_id, peer_id, version, PROTOCOL_VERSION
            );
            socket.close().await;
            return;
        }
        info!("{} {} identified as {}", role, conn_id, peer_id);
        socket.remote_peer = Some(peer_id);
        self.clients.insert(conn_id, socket);
    }

    async fn handle_message(&mut self, conn_id: String, data: Vec<u8>) {
        if !self.clients.contains_key(&conn_id) {
            debug!("dropping frame from {} before hello", conn_id);
            return;
        }
        let message = match WireMessage::from_binary(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable frame from {}: {}", conn_id, e);
                return;
            }
        };

        let doc_id = message.doc_id().to_string();
        match message {
            WireMessage::Update { update, .. } => {
                let fanout = self.join_room(&doc_id, &conn_id);
                if let Err(e) = self.room(&doc_id).doc.import(&update) {
                    warn!("bad update for {} from {}: {}", doc_id, conn_id, e);
                    return;
                }
                self.send_to_members(&fanout, &conn_id, &data).await;
            }
            WireMessage::Snapshot { snapshot, .. } => {
                let fanout = self.join_room(&doc_id, &conn_id);
                if let Err(e) = self.room(&doc_id).doc.import(&snapshot) {
                    warn!("bad snapshot for {} from {}: {}", doc_id, conn_id, e);
                    return;
                }
                self.send_to_members(&fanout, &conn_id, &data).await;
            }
            WireMessage::Ephemeral { ephemeral, .. } => {
                let fanout = self.join_room(&doc_id, &conn_id);
                if let Err(e) = self.room(&doc_id).presence.apply(&ephemeral) {
                    warn!("bad presence for {} from {}: {}", doc_id, conn_id, e);
                    return;
                }
                self.send_to_members(&fanout, &conn_id, &data).await;
            }
            WireMessage::QuerySnapshot { .. } => {
                self.join_room(&doc_id, &conn_id);
                let snapshot = match self.room(&doc_id).doc.export(ExportMode::Snapshot) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!("failed to export snapshot of {}: {}", doc_id, e);
                        return;
                    }
                };
                self.answer(&conn_id, WireMessage::Snapshot { doc_id, snapshot })
                    .await;
            }
            WireMessage::QueryEphemeral { .. } => {
                self.join_room(&doc_id, &conn_id);
                let room = self.room(&doc_id);
                // Long-lived rooms shed entries for peers that vanished
                // without teardown before answering.
                room.presence.prune_expired();
                let ephemeral = room.presence.encode_all();
                self.answer(&conn_id, WireMessage::Ephemeral { doc_id, ephemeral })
                    .await;
            }
        }
    }

    fn handle_closed(&mut self, conn_id: String) {
        if self.pending.remove(&conn_id).is_some() {
            debug!("connection {} closed before hello", conn_id);
            return;
        }
        if self.clients.remove(&conn_id).is_some() {
            info!("client {} disconnected", conn_id);
        }
        // Rooms live only while occupied.
        self.rooms.retain(|doc_id, room| {
            room.members.remove(&conn_id);
            if room.members.is_empty() {
                debug!("dropping empty room {}", doc_id);
                false
            } else {
                true
            }
        });
    }

    /// Add the connection to the room, creating it on first touch. Returns
    /// the other members for fanout.
    fn join_room(&mut self, doc_id: &str, conn_id: &str) -> Vec<String> {
        let room = self
            .rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| {
                info!("opening room {}", doc_id);
                Room::new()
            });
        room.members.insert(conn_id.to_string());
        room.members
            .iter()
            .filter(|member| member.as_str() != conn_id)
            .cloned()
            .collect()
    }

    fn room(&mut self, doc_id: &str) -> &mut Room {
        self.rooms
            .entry(doc_id.to_string())
            .or_insert_with(Room::new)
    }

    /// Relay raw frame bytes to every member except the sender.
    async fn send_to_members(&self, members: &[String], sender: &str, data: &[u8]) {
        for member in members {
            if member == sender {
                continue;
            }
            if let Some(socket) = self.clients.get(member) {
                if let Err(e) = socket.send(data).await {
                    warn!("failed to relay to {}: {}", member, e);
                }
            }
        }
    }

    /// Reply to a single client.
    async fn answer(&self, conn_id: &str, message: WireMessage) {
        let encoded = match message.to_binary() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode answer for {}: {}", conn_id, e);
                return;
            }
        };
        if let Some(socket) = self.clients.get(conn_id) {
            if let Err(e) = socket.send(&encoded).await {
                warn!("failed to answer {}: {}", conn_id, e);
            }
        }
    }
}
