//! Participant collaborator interface.

use crate::error::TapError;
use tap_protocol::Packet;

/// A bus endpoint that hosts a debugger.
///
/// The debugger relies on its participant to finish envelopes, deliver
/// responses to the client that owns the participant, and handle transport
/// packets that are not administrative requests.
pub trait Participant: Send + Sync {
    /// Fill in envelope fields the participant is responsible for.
    fn fix_packet(&self, packet: Packet) -> Packet;

    /// Deliver a packet to the participant's client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client can no longer be reached.
    fn send_to_recipient(&self, packet: Packet) -> Result<(), TapError>;

    /// Generic handler for transport-bound packets without a `resource`.
    ///
    /// # Errors
    ///
    /// Returns an error if the participant cannot process the packet.
    fn handle_transport_packet(&self, packet: Packet) -> Result<(), TapError>;
}

/// Send a response from `sender` to the participant's client.
///
/// Missing `src` defaults to `sender` and missing `response` to `"ok"`.
///
/// # Errors
///
/// Returns an error if delivery fails.
pub fn respond<P: Participant + ?Sized>(
    participant: &P,
    sender: &str,
    mut packet: Packet,
) -> Result<(), TapError> {
    packet.src.get_or_insert_with(|| sender.to_string());
    packet
        .response
        .get_or_insert_with(|| tap_protocol::RESPONSE_OK.to_string());
    let packet = participant.fix_packet(packet);
    participant.send_to_recipient(packet)
}
