//! In-process bus connecting WebSocket participants.
//!
//! Every connection is a participant with its own address. Packets addressed
//! to another participant are routed through the bus peer, which emits a
//! `receive` event when the packet enters the bus and a `send` event when it
//! is handed to the destination. Packets addressed to the transport bypass
//! the peer and go to the connection's debugger.

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tap_core::{Counter, LocalPeer, MetricRegistry, Participant, Peer, PeerEventKind, TapError};
use tap_protocol::{normalize, MsgId, Packet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Outbound queue of a connection.
pub type Outbound = mpsc::Sender<Packet>;

/// Queue `packet` for the client at `address` without waiting.
///
/// A full queue fails the delivery; the packet is dropped.
fn enqueue(outbound: &Outbound, address: &str, packet: Packet) -> Result<(), TapError> {
    outbound.try_send(packet).map_err(|e| match e {
        TrySendError::Full(_) => TapError::Delivery(format!("{address} outbound queue full")),
        TrySendError::Closed(_) => TapError::Delivery(format!("{address} disconnected")),
    })
}

/// Where an inbound packet went.
#[derive(Debug)]
pub enum Ingress {
    /// Addressed to the transport; handle administratively.
    Transport(Packet),
    /// Delivered to another participant.
    Routed,
}

/// The message bus.
pub struct Bus {
    peer: Arc<LocalPeer>,
    connections: Arc<DashMap<String, Outbound>>,
    next_connection: AtomicU64,
    queue_capacity: usize,
    sent: Arc<Counter>,
    received: Arc<Counter>,
}

impl Bus {
    /// Create a bus and register its metrics in `registry`.
    ///
    /// Each connection may hold up to `queue_capacity` undelivered packets.
    ///
    /// # Errors
    ///
    /// Returns an error if a bus metric name is already taken.
    pub fn new(registry: &MetricRegistry, queue_capacity: usize) -> Result<Self, TapError> {
        let connections: Arc<DashMap<String, Outbound>> = Arc::new(DashMap::new());
        let started = Instant::now();

        let participants = Arc::clone(&connections);
        registry.gauge("transport.participants", move || json!(participants.len()))?;
        registry.gauge("transport.uptime", move || json!(started.elapsed().as_secs()))?;

        Ok(Self {
            peer: Arc::new(LocalPeer::new()),
            connections,
            next_connection: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            sent: registry.counter("transport.packets.sent")?,
            received: registry.counter("transport.packets.received")?,
        })
    }

    /// Attach a new participant.
    ///
    /// Returns the participant and the queue of packets to write to its client.
    pub fn connect(&self, sender: &str) -> (Arc<ConnectionParticipant>, mpsc::Receiver<Packet>) {
        let address = format!(
            "conn_{}",
            self.next_connection.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.connections.insert(address.clone(), tx.clone());
        debug!(connection = %address, "Participant attached");

        (
            Arc::new(ConnectionParticipant::new(address, sender, tx)),
            rx,
        )
    }

    /// Attach a new participant unless that would exceed `limit`.
    ///
    /// The participant is attached before counting, so concurrent callers
    /// never overshoot the limit together.
    pub fn admit(
        &self,
        sender: &str,
        limit: usize,
    ) -> Option<(Arc<ConnectionParticipant>, mpsc::Receiver<Packet>)> {
        let (participant, rx) = self.connect(sender);
        if self.connections.len() > limit {
            self.disconnect(participant.address());
            return None;
        }
        Some((participant, rx))
    }

    /// Detach a participant.
    pub fn disconnect(&self, address: &str) {
        if self.connections.remove(address).is_some() {
            debug!(connection = %address, "Participant detached");
        }
    }

    /// Number of attached participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether no participants are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The peer carrying routed traffic.
    #[must_use]
    pub fn peer(&self) -> Arc<dyn Peer> {
        Arc::clone(&self.peer) as Arc<dyn Peer>
    }

    /// Accept a packet from the participant at `from`.
    ///
    /// The packet's `src` is always set to `from`.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::Delivery`] if a routed packet has no reachable
    /// destination.
    pub fn ingest(&self, from: &str, mut packet: Packet) -> Result<Ingress, TapError> {
        packet.src = Some(from.to_string());
        if packet.is_transport_bound() {
            return Ok(Ingress::Transport(packet));
        }

        self.received.inc();
        self.peer.emit(PeerEventKind::Receive, packet.clone());
        self.deliver(packet)?;
        Ok(Ingress::Routed)
    }

    fn deliver(&self, packet: Packet) -> Result<(), TapError> {
        let dst = packet
            .dst
            .clone()
            .ok_or_else(|| TapError::Delivery("packet has no destination".to_string()))?;
        let outbound = self
            .connections
            .get(&dst)
            .map(|tx| tx.clone())
            .ok_or_else(|| TapError::Delivery(format!("no participant at {dst}")))?;

        enqueue(&outbound, &dst, packet.clone())?;
        self.sent.inc();
        trace!(dst = %dst, "Packet routed");

        self.peer.emit(PeerEventKind::Send, packet);
        Ok(())
    }
}

/// Participant backing one WebSocket connection.
pub struct ConnectionParticipant {
    address: String,
    sender: String,
    outbound: Outbound,
    next_msg_id: AtomicU64,
}

impl ConnectionParticipant {
    fn new(address: String, sender: &str, outbound: Outbound) -> Self {
        Self {
            address,
            sender: sender.to_string(),
            outbound,
            next_msg_id: AtomicU64::new(0),
        }
    }

    /// Bus address of this participant.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Packet announcing the participant's address to its client.
    #[must_use]
    pub fn greeting(&self, reply_to: Option<MsgId>) -> Packet {
        let mut packet = Packet::reply(reply_to, None, Some(json!({ "address": self.address })));
        packet.src = Some(self.sender.clone());
        self.fix_packet(packet)
    }
}

impl Participant for ConnectionParticipant {
    fn fix_packet(&self, mut packet: Packet) -> Packet {
        packet.dst.get_or_insert_with(|| self.address.clone());
        normalize(packet, &self.sender, || {
            MsgId::new(format!(
                "i:{}",
                self.next_msg_id.fetch_add(1, Ordering::Relaxed)
            ))
        })
    }

    fn send_to_recipient(&self, packet: Packet) -> Result<(), TapError> {
        enqueue(&self.outbound, &self.address, packet)
    }

    /// Transport packets without a resource are address queries.
    fn handle_transport_packet(&self, packet: Packet) -> Result<(), TapError> {
        self.send_to_recipient(self.greeting(packet.msg_id))
    }
}
