//! Watch registry and event tap.
//!
//! The registry maps a watcher's request id to its subscription. While at
//! least one watch is live the registry holds a [`Tap`]: one handler
//! registered on the peer's `send` event and one on its `receive` event.
//! The first watch installs the tap and removing the last one drops it.

use crate::peer::{HandlerId, Peer, PeerEventKind, PeerHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tap_protocol::{MsgId, Packet};
use tracing::debug;

/// An active traffic watch.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    /// Id of the request that started the watch. Notifications reply to it.
    pub request_id: MsgId,
    /// The start request as received.
    pub original: Packet,
}

/// Installed pair of peer handlers.
///
/// Dropping the tap removes both handlers from the peer.
struct Tap {
    peer: Arc<dyn Peer>,
    send: HandlerId,
    receive: HandlerId,
}

impl Tap {
    fn install(peer: &Arc<dyn Peer>, handler: &PeerHandler) -> Self {
        let receive = peer.on(PeerEventKind::Receive, Arc::clone(handler));
        let send = peer.on(PeerEventKind::Send, Arc::clone(handler));
        debug!("Traffic tap installed");
        Self {
            peer: Arc::clone(peer),
            send,
            receive,
        }
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.peer.off(PeerEventKind::Receive, self.receive);
        self.peer.off(PeerEventKind::Send, self.send);
        debug!("Traffic tap removed");
    }
}

#[derive(Default)]
struct WatchState {
    entries: HashMap<MsgId, WatchEntry>,
    tap: Option<Tap>,
}

impl WatchState {
    /// Bring the tap in line with the entry table.
    fn reconcile(&mut self, peer: &Arc<dyn Peer>, handler: &PeerHandler) {
        match (self.entries.is_empty(), self.tap.is_some()) {
            (false, false) => self.tap = Some(Tap::install(peer, handler)),
            (true, true) => self.tap = None,
            _ => {}
        }
    }
}

/// Table of live watches for one debugger.
///
/// The entry table and the tap live behind one lock, so installing and
/// removing the tap is atomic with the emptiness check.
pub struct WatchRegistry {
    peer: Arc<dyn Peer>,
    handler: PeerHandler,
    state: Mutex<WatchState>,
}

impl WatchRegistry {
    /// Create an empty registry. `handler` is what the tap registers on the peer.
    #[must_use]
    pub fn new(peer: Arc<dyn Peer>, handler: PeerHandler) -> Self {
        Self {
            peer,
            handler,
            state: Mutex::new(WatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching under `request_id`.
    ///
    /// Re-using a live id replaces its entry. Returns `true` if the id was new.
    pub fn start(&self, request_id: MsgId, original: Packet) -> bool {
        let mut state = self.lock();
        let entry = WatchEntry {
            request_id: request_id.clone(),
            original,
        };
        let is_new = state.entries.insert(request_id.clone(), entry).is_none();
        state.reconcile(&self.peer, &self.handler);

        debug!(watch = %request_id, watchers = state.entries.len(), "Watch started");
        is_new
    }

    /// Stop the watch started under `request_id`.
    ///
    /// Unknown ids are a no-op. Returns `true` if a watch was removed.
    pub fn stop(&self, request_id: &MsgId) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(request_id).is_some();
        state.reconcile(&self.peer, &self.handler);

        if removed {
            debug!(watch = %request_id, watchers = state.entries.len(), "Watch stopped");
        }
        removed
    }

    /// Request ids of every live watch.
    #[must_use]
    pub fn watchers(&self) -> Vec<MsgId> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Get a live watch.
    #[must_use]
    pub fn get(&self, request_id: &MsgId) -> Option<WatchEntry> {
        self.lock().entries.get(request_id).cloned()
    }

    /// Number of live watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if there are no live watches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Check whether the tap is currently installed on the peer.
    #[must_use]
    pub fn is_tapped(&self) -> bool {
        self.lock().tap.is_some()
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WatchRegistry")
            .field("watchers", &state.entries.len())
            .field("tapped", &state.tap.is_some())
            .finish()
    }
}
