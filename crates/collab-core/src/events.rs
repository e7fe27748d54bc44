//! Event infrastructure for the synchronization core.
//!
//! `EventBus<E>` is a subscribe/emit registry shared by the presence store,
//! the relay bridge, and the provider. Subscriptions unsubscribe themselves
//! on drop, so no caller ever has to remember a teardown call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::envelope::ConnectionStatus;

/// Events emitted by a provider for one logical document.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderEvent {
    /// The derived "caught up" flag changed.
    Sync { synced: bool },
    /// Transport connectivity changed.
    Status { status: ConnectionStatus },
    /// A remote update was applied to the document.
    Update { update: Vec<u8> },
    /// The document handle was swapped wholesale; listeners must re-bind.
    Reload {
        #[serde(rename = "docId")]
        doc_id: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events of one type to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(E) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drop every subscriber at once. Used by dispose paths.
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<E: Clone> EventBus<E> {
    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
