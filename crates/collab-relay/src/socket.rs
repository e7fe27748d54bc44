//! WebSocket plumbing shared by the server and the client host.
//!
//! A [`Socket`] wraps one WebSocket stream, splitting it so writes happen
//! inline while a spawned task drains the read half into an event channel.
//! The hello exchange is surfaced as its own event; everything after it is
//! raw frame data for the caller to decode.

use crate::protocol::{is_likely_hello, HelloMessage, MAX_MESSAGE_SIZE};
use anyhow::{anyhow, Result};
use collab_core::PeerId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

/// A socket accepted by the server.
pub type ServerSocket = Socket<TcpStream>;
/// A socket dialed by the client host.
pub type ClientSocket = Socket<MaybeTlsStream<TcpStream>>;

/// Event emitted by a socket's read task.
#[derive(Debug)]
pub enum SocketEvent {
    /// The remote side introduced itself.
    Hello {
        conn_id: String,
        peer_id: String,
        role: String,
        version: u32,
    },
    /// A post-hello frame.
    Message { conn_id: String, data: Vec<u8> },
    /// The socket closed or errored.
    Closed { conn_id: String },
}

/// One WebSocket connection, either direction.
pub struct Socket<S> {
    /// Identifier the owner routes events by. The server uses "conn-N",
    /// the host uses the adapter id.
    pub conn_id: String,
    /// Remote identity, known after the hello.
    pub remote_peer: Option<String>,
    write: Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl<S> Socket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a WebSocket stream and start draining its read half into
    /// `event_tx`.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            remote_peer: None,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: SplitStream<WebSocketStream<S>>,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("received close frame on {}", conn_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "frame on {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if is_likely_hello(&data) {
                        if let Some(hello) = HelloMessage::from_binary(&data) {
                            debug!(
                                "received hello on {} (peer: {}, role: {}, version: {})",
                                conn_id, hello.peer_id, hello.role, hello.version
                            );
                            let _ = event_tx.send(SocketEvent::Hello {
                                conn_id: conn_id.clone(),
                                peer_id: hello.peer_id,
                                role: hello.role,
                                version: hello.version,
                            });
                            continue;
                        }
                    }

                    let _ = event_tx.send(SocketEvent::Message {
                        conn_id: conn_id.clone(),
                        data,
                    });
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("socket {} closed", conn_id);
                        }
                        _ => {
                            error!("websocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("socket {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(SocketEvent::Closed { conn_id });
    }

    /// Send binary data as a binary WebSocket frame.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| anyhow!("failed to send frame: {}", e))
    }

    /// Introduce ourselves to the remote side.
    pub async fn send_hello(&self, peer: PeerId, role: &str) -> Result<()> {
        self.send(&HelloMessage::new(peer, role).to_binary()).await
    }

    /// Close the socket gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl<S> Drop for Socket<S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
