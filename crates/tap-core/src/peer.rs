//! Peer event stream.
//!
//! A peer is the object through which a participant's packets actually flow.
//! It emits a `send` event for every outgoing packet and a `receive` event for
//! every incoming one. Observers attach with [`Peer::on`] and detach with
//! [`Peer::off`] using the returned [`HandlerId`].

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tap_protocol::Packet;
use tracing::{debug, trace};

/// Kind of peer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerEventKind {
    /// A packet left the peer.
    Send,
    /// A packet arrived at the peer.
    Receive,
}

impl PeerEventKind {
    /// Event name as used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerEventKind::Send => "send",
            PeerEventKind::Receive => "receive",
        }
    }
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intercepted packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerEvent {
    /// Direction of the packet.
    pub kind: PeerEventKind,
    /// The packet as it flowed through the peer.
    pub packet: Packet,
}

/// Registration handle returned by [`Peer::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback invoked for each peer event.
pub type PeerHandler = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Source of `send`/`receive` events.
pub trait Peer: Send + Sync {
    /// Register a handler for an event kind.
    fn on(&self, kind: PeerEventKind, handler: PeerHandler) -> HandlerId;

    /// Remove a handler.
    ///
    /// Returns `true` if the handler was registered.
    fn off(&self, kind: PeerEventKind, id: HandlerId) -> bool;
}

/// In-process peer.
///
/// Handlers are called outside of any internal lock, so a handler may itself
/// register or remove handlers.
#[derive(Default)]
pub struct LocalPeer {
    handlers: DashMap<PeerEventKind, Vec<(HandlerId, PeerHandler)>>,
    next_id: AtomicU64,
}

impl LocalPeer {
    /// Create a peer with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an event to every handler registered for `kind`.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, kind: PeerEventKind, packet: Packet) -> usize {
        let handlers: Vec<PeerHandler> = self
            .handlers
            .get(&kind)
            .map(|h| h.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            return 0;
        }

        let event = PeerEvent { kind, packet };
        for handler in &handlers {
            handler(&event);
        }
        trace!(event = %kind, handlers = handlers.len(), "Peer event emitted");
        handlers.len()
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: PeerEventKind) -> usize {
        self.handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }
}

impl Peer for LocalPeer {
    fn on(&self, kind: PeerEventKind, handler: PeerHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.entry(kind).or_default().push((id, handler));
        debug!(event = %kind, "Peer handler registered");
        id
    }

    fn off(&self, kind: PeerEventKind, id: HandlerId) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        let removed = handlers.len() != before;
        if removed {
            debug!(event = %kind, "Peer handler removed");
        }
        removed
    }
}

impl fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPeer")
            .field("send_handlers", &self.handler_count(PeerEventKind::Send))
            .field("receive_handlers", &self.handler_count(PeerEventKind::Receive))
            .finish()
    }
}
