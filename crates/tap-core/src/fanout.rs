//! Notification fan-out.
//!
//! Every intercepted packet becomes one `changed` notification per watcher,
//! each replying to the request id that started that watch.

use crate::error::TapError;
use crate::participant::{respond, Participant};
use crate::peer::PeerEvent;
use tap_protocol::{MsgId, Packet, RESPONSE_CHANGED};
use tracing::{trace, warn};

/// Notify each watcher of `event`.
///
/// A failed delivery does not stop delivery to the remaining watchers.
/// Returns the number of notifications delivered.
///
/// # Errors
///
/// Returns [`TapError::FanoutIncomplete`] if any delivery failed, after every
/// watcher was attempted.
pub fn notify<P: Participant + ?Sized>(
    participant: &P,
    sender: &str,
    watchers: &[MsgId],
    event: &PeerEvent,
) -> Result<usize, TapError> {
    if watchers.is_empty() {
        return Ok(0);
    }

    let entity = serde_json::to_value(event)?;
    let mut failed = 0;

    for watcher in watchers {
        let notification = Packet::reply(
            Some(watcher.clone()),
            Some(RESPONSE_CHANGED),
            Some(entity.clone()),
        );
        if let Err(e) = respond(participant, sender, notification) {
            warn!(watch = %watcher, error = %e, "Failed to deliver traffic notification");
            failed += 1;
        }
    }

    trace!(event = %event.kind, watchers = watchers.len(), failed, "Traffic notification fanned out");

    if failed > 0 {
        return Err(TapError::FanoutIncomplete {
            failed,
            attempted: watchers.len(),
        });
    }
    Ok(watchers.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerEventKind;
    use crate::testing::RecordingParticipant;
    use tap_protocol::TRANSPORT_ADDRESS;

    fn event() -> PeerEvent {
        PeerEvent {
            kind: PeerEventKind::Send,
            packet: Packet::default().with_dst("conn_7"),
        }
    }

    #[test]
    fn test_one_notification_per_watcher() {
        let participant = RecordingParticipant::new();
        let watchers = vec![MsgId::from("a"), MsgId::from("b")];

        let delivered = notify(&participant, TRANSPORT_ADDRESS, &watchers, &event()).unwrap();
        assert_eq!(delivered, 2);

        let sent = participant.sent();
        let mut reply_to: Vec<_> = sent.iter().filter_map(|p| p.reply_to.clone()).collect();
        reply_to.sort();
        assert_eq!(reply_to, watchers);

        for packet in &sent {
            assert_eq!(packet.response.as_deref(), Some(RESPONSE_CHANGED));
            assert_eq!(packet.src.as_deref(), Some(TRANSPORT_ADDRESS));
            assert_eq!(packet.entity.as_ref().unwrap()["packet"]["dst"], "conn_7");
        }
    }

    #[test]
    fn test_failed_delivery_does_not_skip_others() {
        let participant = RecordingParticipant::new();
        participant.fail_delivery_to("a");
        let watchers = vec![MsgId::from("a"), MsgId::from("b"), MsgId::from("c")];

        let err = notify(&participant, TRANSPORT_ADDRESS, &watchers, &event()).unwrap_err();
        assert!(matches!(
            err,
            TapError::FanoutIncomplete {
                failed: 1,
                attempted: 3
            }
        ));
        assert_eq!(participant.sent().len(), 2);
    }

    #[test]
    fn test_no_watchers_sends_nothing() {
        let participant = RecordingParticipant::new();
        assert_eq!(notify(&participant, TRANSPORT_ADDRESS, &[], &event()).unwrap(), 0);
        assert!(participant.sent().is_empty());
    }
}
