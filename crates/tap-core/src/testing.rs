//! Test doubles shared by the unit tests.

use crate::error::TapError;
use crate::participant::Participant;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tap_protocol::{normalize, MsgId, Packet};

/// Participant that records everything it is asked to deliver.
#[derive(Default)]
pub(crate) struct RecordingParticipant {
    sent: Mutex<Vec<Packet>>,
    forwarded: Mutex<Vec<Packet>>,
    failing: Mutex<HashSet<MsgId>>,
    next_id: AtomicU64,
}

impl RecordingParticipant {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make deliveries replying to `id` fail.
    pub(crate) fn fail_delivery_to(&self, id: &str) {
        self.failing.lock().unwrap().insert(MsgId::from(id));
    }

    pub(crate) fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn forwarded(&self) -> Vec<Packet> {
        self.forwarded.lock().unwrap().clone()
    }
}

impl Participant for RecordingParticipant {
    fn fix_packet(&self, packet: Packet) -> Packet {
        normalize(packet, "test", || {
            MsgId::new(format!("t:{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
        })
    }

    fn send_to_recipient(&self, packet: Packet) -> Result<(), TapError> {
        if let Some(reply_to) = &packet.reply_to {
            if self.failing.lock().unwrap().contains(reply_to) {
                return Err(TapError::Delivery(format!("client for {reply_to} is gone")));
            }
        }
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn handle_transport_packet(&self, packet: Packet) -> Result<(), TapError> {
        self.forwarded.lock().unwrap().push(packet);
        Ok(())
    }
}
