//! Message relay bridge between the sandboxed client and the host process.
//!
//! The sandboxed side cannot open sockets; everything it sends and receives
//! travels over one duplex frame channel owned by the host. The bridge
//! multiplexes that channel: fire-and-forget sends, broadcast listeners for
//! inbound frames, and a request/response pattern correlated by request id.
//! One bridge is constructed per process lifetime and passed explicitly to
//! every provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::envelope::{RelayEnvelope, RelayFrame};
use crate::events::{EventBus, Subscription};

/// How long `request` waits before giving up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    ChannelClosed,

    #[error("request {request_id} timed out after {timeout_ms} ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("request {request_id} cancelled before a response arrived")]
    Cancelled { request_id: String },
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Host-process end of a relay channel pair.
///
/// `from_client` yields every frame the sandboxed side sends; frames pushed
/// into `to_client` are dispatched to the bridge's listeners and pending
/// requests.
pub struct HostEndpoint {
    pub from_client: mpsc::UnboundedReceiver<RelayFrame>,
    pub to_client: mpsc::UnboundedSender<RelayFrame>,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RelayFrame>>>>;

/// Client end of the relay channel.
pub struct RelayBridge {
    outbound: mpsc::UnboundedSender<RelayFrame>,
    pending: PendingMap,
    listeners: Arc<EventBus<RelayFrame>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelayBridge {
    /// Build a bridge over explicit channel halves.
    pub fn new(
        outbound: mpsc::UnboundedSender<RelayFrame>,
        mut inbound: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listeners = Arc::new(EventBus::new());

        let pump_pending = Arc::clone(&pending);
        let pump_listeners = Arc::clone(&listeners);
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                Self::dispatch(&pump_pending, &pump_listeners, frame);
            }
        });

        Self {
            outbound,
            pending,
            listeners,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Build a connected bridge/host pair over in-process channels.
    pub fn pair() -> (Self, HostEndpoint) {
        let (to_host, from_client) = mpsc::unbounded_channel();
        let (to_client, from_host) = mpsc::unbounded_channel();
        let bridge = Self::new(to_host, from_host);
        (
            bridge,
            HostEndpoint {
                from_client,
                to_client,
            },
        )
    }

    fn dispatch(pending: &PendingMap, listeners: &Arc<EventBus<RelayFrame>>, frame: RelayFrame) {
        if let Some(request_id) = frame.request_id.clone() {
            let sender = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            match sender {
                Some(tx) => {
                    // Responses are consumed here, never rebroadcast.
                    let _ = tx.send(frame);
                }
                None => {
                    // The request already timed out or was cleared.
                    trace!(request_id, "dropping response with no pending request");
                }
            }
            return;
        }
        listeners.emit(frame);
    }

    /// Fire-and-forget post of an envelope to the host.
    pub fn send(&self, envelope: RelayEnvelope) -> Result<()> {
        self.outbound
            .send(RelayFrame::new(envelope))
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Send an envelope and await the correlated response.
    pub async fn request(&self, envelope: RelayEnvelope) -> Result<RelayEnvelope> {
        self.request_with_timeout(envelope, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// `request` with an explicit timeout.
    pub async fn request_with_timeout(
        &self,
        envelope: RelayEnvelope,
        timeout: Duration,
    ) -> Result<RelayEnvelope> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);

        let frame = RelayFrame::with_request_id(envelope, request_id.clone());
        if self.outbound.send(frame).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(RelayError::ChannelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame.envelope),
            // Sender dropped without a response: cleared at teardown.
            Ok(Err(_)) => Err(RelayError::Cancelled { request_id }),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                Err(RelayError::Timeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Register a broadcast listener for inbound frames that are not matched
    /// responses. The handle unsubscribes on drop.
    pub fn on(
        &self,
        handler: impl Fn(RelayFrame) + Send + Sync + 'static,
    ) -> Subscription<RelayFrame> {
        self.listeners.subscribe(handler)
    }

    /// Reject and remove every outstanding request. Used at teardown so no
    /// caller is left suspended.
    pub fn clear_pending_requests(&self) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "clearing pending relay requests");
        }
        // Dropping the senders rejects the waiting futures.
    }

    /// Outstanding request count, for diagnostics.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for RelayBridge {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.clear_pending_requests();
    }
}
