//! Debugger participant.
//!
//! A [`Debugger`] answers administrative packets addressed to the transport
//! on behalf of one participant:
//!
//! | resource  | action         | effect                                      |
//! |-----------|----------------|---------------------------------------------|
//! | `traffic` | `start`        | watch every packet crossing the peer        |
//! | `traffic` | `stop`         | cancel the watch named by `entity.msgId`    |
//! | `metrics` | `getAll`       | snapshot every metric                       |
//! | `apis`    | `getEndpoints` | list endpoints once discovery has finished  |
//!
//! Packets without a `resource` go to the participant's generic handler.

use crate::dispatch::{self, Outcome, Route};
use crate::endpoints::ApiRegistry;
use crate::error::TapError;
use crate::fanout;
use crate::gather;
use crate::metrics::MetricsSource;
use crate::participant::{respond, Participant};
use crate::peer::{Peer, PeerEvent, PeerHandler};
use crate::readiness::Readiness;
use crate::watch::WatchRegistry;
use std::sync::{Arc, Weak};
use tap_protocol::{Packet, TRANSPORT_ADDRESS};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

/// Debugger configuration.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Sender identity stamped on responses.
    pub sender: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            sender: TRANSPORT_ADDRESS.to_string(),
        }
    }
}

/// Bus-wide collaborators shared by every debugger.
#[derive(Clone)]
pub struct Wiring {
    /// Metrics read by `metrics getAll`.
    pub metrics: Arc<dyn MetricsSource>,
    /// APIs listed by `apis getEndpoints`.
    pub apis: Arc<dyn ApiRegistry>,
    /// Settles once the initial endpoint gather is complete.
    pub readiness: Readiness,
}

struct Inner<P> {
    participant: Arc<P>,
    wiring: Wiring,
    config: DebuggerConfig,
    watches: WatchRegistry,
}

impl<P: Participant> Inner<P> {
    fn respond(&self, packet: Packet) -> Result<(), TapError> {
        respond(self.participant.as_ref(), &self.config.sender, packet)
    }

    fn notify(&self, event: &PeerEvent) -> Result<usize, TapError> {
        let watchers = self.watches.watchers();
        fanout::notify(
            self.participant.as_ref(),
            &self.config.sender,
            &watchers,
            event,
        )
    }

    fn start_watch(&self, packet: Packet) -> Result<Outcome, TapError> {
        let reply_to = packet.msg_id.clone();
        match &reply_to {
            Some(id) => {
                self.watches.start(id.clone(), packet);
            }
            None => debug!("Traffic watch without msgId, nothing to register"),
        }
        self.respond(Packet::reply(reply_to, None, None))?;
        Ok(Outcome::Responded)
    }

    fn stop_watch(&self, packet: &Packet) -> Result<Outcome, TapError> {
        // The subscription is named by the id of the request that started it,
        // carried in the entity, not by this request's own msgId.
        if let Some(id) = packet.entity_msg_id() {
            self.watches.stop(&id);
        }
        self.respond(Packet::reply(packet.msg_id.clone(), None, None))?;
        Ok(Outcome::Responded)
    }

    fn gather_metrics(&self, packet: &Packet) -> Result<Outcome, TapError> {
        let samples = gather::metric_snapshot(self.wiring.metrics.as_ref())?;
        let entity = serde_json::to_value(samples)?;
        self.respond(Packet::reply(packet.msg_id.clone(), None, Some(entity)))?;
        Ok(Outcome::Responded)
    }
}

/// Administrative endpoint for one participant.
///
/// The watch registry lives and dies with the debugger; dropping the last
/// handle removes any installed tap from the peer.
pub struct Debugger<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for Debugger<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Participant + 'static> Debugger<P> {
    /// Create a debugger observing `peer` on behalf of `participant`.
    #[must_use]
    pub fn new(
        participant: Arc<P>,
        peer: Arc<dyn Peer>,
        wiring: Wiring,
        config: DebuggerConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<P>>| {
            let weak = weak.clone();
            let handler: PeerHandler = Arc::new(move |event: &PeerEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.notify(event) {
                    warn!(error = %e, "Traffic notification failed");
                }
            });
            Inner {
                participant,
                wiring,
                config,
                watches: WatchRegistry::new(peer, handler),
            }
        });
        Self { inner }
    }

    /// Handle a packet addressed to the transport.
    ///
    /// # Errors
    ///
    /// Returns the collaborator error that prevented a response. Failures of
    /// a deferred endpoint gather are reported through
    /// [`Outcome::Pending`] instead.
    pub fn handle_transport_packet(&self, packet: Packet) -> Result<Outcome, TapError> {
        if packet.resource.is_none() {
            trace!("Transport packet without resource, forwarding");
            self.inner.participant.handle_transport_packet(packet)?;
            return Ok(Outcome::Forwarded);
        }

        let resource = packet.resource.as_deref().unwrap_or_default();
        let action = packet.action.as_deref().unwrap_or_default();
        let Some(route) = dispatch::route(resource, action) else {
            return Ok(Outcome::Ignored);
        };

        trace!(route = ?route, "Administrative request");
        match route {
            Route::TrafficStart => self.inner.start_watch(packet),
            Route::TrafficStop => self.inner.stop_watch(&packet),
            Route::MetricsGetAll => self.inner.gather_metrics(&packet),
            Route::ApisGetEndpoints => self.gather_endpoints(&packet),
        }
    }

    /// Answer `apis getEndpoints`.
    ///
    /// Answered inline once readiness has settled. Before that the answer
    /// comes from a background task, and each request waits on the shared
    /// readiness signal independently.
    fn gather_endpoints(&self, packet: &Packet) -> Result<Outcome, TapError> {
        if self.inner.wiring.readiness.is_ready() {
            let endpoints = gather::list_endpoints(self.inner.wiring.apis.as_ref())?;
            let entity = serde_json::to_value(endpoints)?;
            self.inner
                .respond(Packet::reply(packet.msg_id.clone(), None, Some(entity)))?;
            return Ok(Outcome::Responded);
        }

        let runtime = Handle::try_current().map_err(|_| TapError::NoRuntime)?;
        let inner = Arc::clone(&self.inner);
        let reply_to = packet.msg_id.clone();

        let task = runtime.spawn(async move {
            let endpoints =
                gather::endpoint_snapshot(inner.wiring.apis.as_ref(), &inner.wiring.readiness)
                    .await?;
            let entity = serde_json::to_value(endpoints)?;
            inner.respond(Packet::reply(reply_to, None, Some(entity)))
        });
        Ok(Outcome::Pending(task))
    }

    /// The participant this debugger answers for.
    #[must_use]
    pub fn participant(&self) -> &Arc<P> {
        &self.inner.participant
    }

    /// Live traffic watches.
    #[must_use]
    pub fn watches(&self) -> &WatchRegistry {
        &self.inner.watches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{Endpoint, EndpointTable};
    use crate::metrics::MetricRegistry;
    use crate::peer::{LocalPeer, PeerEventKind};
    use crate::readiness::readiness;
    use crate::testing::RecordingParticipant;
    use serde_json::json;
    use std::time::Duration;
    use tap_protocol::{MsgId, RESPONSE_CHANGED, RESPONSE_OK};

    struct Fixture {
        peer: Arc<LocalPeer>,
        participant: Arc<RecordingParticipant>,
        debugger: Debugger<RecordingParticipant>,
    }

    fn fixture_with(readiness: Readiness) -> Fixture {
        let metrics = MetricRegistry::new();
        metrics.gauge("a", || json!(1)).unwrap();
        metrics.gauge("b", || json!(2)).unwrap();

        let apis = EndpointTable::new();
        apis.register_endpoint(
            "/api/names",
            Endpoint {
                name: "ozp:names".into(),
                base_url: "https://bus.local/api/names".into(),
            },
        );
        apis.attach("names.api", "/api/names");

        let wiring = Wiring {
            metrics: Arc::new(metrics),
            apis: Arc::new(apis),
            readiness,
        };

        let peer = Arc::new(LocalPeer::new());
        let participant = Arc::new(RecordingParticipant::new());
        let debugger = Debugger::new(
            Arc::clone(&participant),
            Arc::clone(&peer) as Arc<dyn Peer>,
            wiring,
            DebuggerConfig::default(),
        );
        Fixture {
            peer,
            participant,
            debugger,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Readiness::none())
    }

    fn stop(msg_id: &str, watch: &str) -> Packet {
        Packet::request(msg_id, "traffic", "stop").with_entity(json!({ "msgId": watch }))
    }

    fn handled(f: &Fixture, packet: Packet) -> Outcome {
        f.debugger.handle_transport_packet(packet).unwrap()
    }

    #[test]
    fn test_start_acknowledges_and_taps() {
        let f = fixture();
        let outcome = handled(&f, Packet::request("A", "traffic", "start"));
        assert!(matches!(outcome, Outcome::Responded));

        let sent = f.participant.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, Some(MsgId::from("A")));
        assert_eq!(sent[0].response.as_deref(), Some(RESPONSE_OK));
        assert_eq!(sent[0].src.as_deref(), Some(TRANSPORT_ADDRESS));
        assert!(sent[0].entity.is_none());

        assert!(f.debugger.watches().is_tapped());
        assert_eq!(f.peer.handler_count(PeerEventKind::Send), 1);
        assert_eq!(f.peer.handler_count(PeerEventKind::Receive), 1);
    }

    #[test]
    fn test_single_watch_receives_one_notification() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        f.participant.take_sent();

        f.peer
            .emit(PeerEventKind::Receive, Packet::default().with_dst("conn_2"));

        let sent = f.participant.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, Some(MsgId::from("A")));
        assert_eq!(sent[0].response.as_deref(), Some(RESPONSE_CHANGED));
        assert_eq!(sent[0].entity.as_ref().unwrap()["kind"], "receive");
    }

    #[test]
    fn test_two_watches_each_notified_once() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        handled(&f, Packet::request("B", "traffic", "start"));
        f.participant.take_sent();

        assert_eq!(f.peer.handler_count(PeerEventKind::Send), 1);
        f.peer.emit(PeerEventKind::Send, Packet::default());

        let mut reply_to: Vec<_> = f
            .participant
            .take_sent()
            .into_iter()
            .filter_map(|p| p.reply_to)
            .collect();
        reply_to.sort();
        assert_eq!(reply_to, vec![MsgId::from("A"), MsgId::from("B")]);
    }

    #[test]
    fn test_stop_last_watch_silences_notifications() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        handled(&f, stop("S", "A"));

        let acks = f.participant.take_sent();
        assert_eq!(acks[1].reply_to, Some(MsgId::from("S")));
        assert!(!f.debugger.watches().is_tapped());
        assert_eq!(f.peer.handler_count(PeerEventKind::Receive), 0);

        assert_eq!(f.peer.emit(PeerEventKind::Receive, Packet::default()), 0);
        assert!(f.participant.sent().is_empty());
    }

    #[test]
    fn test_stop_unknown_watch_acknowledges_only() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        handled(&f, stop("S", "never-started"));

        let acks = f.participant.take_sent();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].reply_to, Some(MsgId::from("S")));
        assert!(f.debugger.watches().is_tapped());

        handled(&f, stop("T", "never-started"));
        handled(&f, stop("U", "A"));
        handled(&f, stop("V", "A"));
        assert!(!f.debugger.watches().is_tapped());
        assert_eq!(f.peer.handler_count(PeerEventKind::Send), 0);
    }

    #[test]
    fn test_stop_without_entity_is_noop() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        handled(&f, Packet::request("A", "traffic", "stop"));

        assert_eq!(f.debugger.watches().len(), 1);
        assert_eq!(f.participant.sent().len(), 2);
    }

    #[test]
    fn test_start_without_msg_id_registers_nothing() {
        let f = fixture();
        let mut packet = Packet::request("x", "traffic", "start");
        packet.msg_id = None;
        handled(&f, packet);

        assert!(f.debugger.watches().is_empty());
        assert!(!f.debugger.watches().is_tapped());
        let sent = f.participant.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].reply_to.is_none());
    }

    #[test]
    fn test_mixed_case_and_whitespace_route() {
        let f = fixture();
        handled(&f, Packet::request("A", "TRAFFIC", " Start "));

        assert!(f.debugger.watches().is_tapped());
        assert_eq!(f.debugger.watches().watchers(), vec![MsgId::from("A")]);
    }

    #[test]
    fn test_missing_resource_is_forwarded() {
        let f = fixture();
        let mut packet = Packet::request("A", "traffic", "start");
        packet.resource = None;

        let outcome = handled(&f, packet.clone());
        assert!(matches!(outcome, Outcome::Forwarded));
        assert_eq!(f.participant.forwarded(), vec![packet]);
        assert!(f.participant.sent().is_empty());
    }

    #[test]
    fn test_unknown_requests_are_ignored() {
        let f = fixture();
        for (resource, action) in [("traffic", "pause"), ("names", "get"), ("metrics", "")] {
            let outcome = handled(&f, Packet::request("A", resource, action));
            assert!(matches!(outcome, Outcome::Ignored));
        }
        let mut no_action = Packet::request("A", "apis", "x");
        no_action.action = None;
        assert!(matches!(handled(&f, no_action), Outcome::Ignored));

        assert!(f.participant.sent().is_empty());
        assert!(f.participant.forwarded().is_empty());
    }

    #[test]
    fn test_metrics_get_all() {
        let f = fixture();
        handled(&f, Packet::request("M", "metrics", "getAll"));

        let sent = f.participant.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, Some(MsgId::from("M")));

        let samples: Vec<gather::MetricSample> =
            serde_json::from_value(sent[0].entity.clone().unwrap()).unwrap();
        let mut pairs: Vec<_> = samples.into_iter().map(|s| (s.name, s.value)).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            pairs,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
    }

    #[test]
    fn test_delivery_failure_propagates() {
        let f = fixture();
        f.participant.fail_delivery_to("M");
        let result = f
            .debugger
            .handle_transport_packet(Packet::request("M", "metrics", "getAll"));
        assert!(matches!(result, Err(TapError::Delivery(_))));
    }

    #[test]
    fn test_get_endpoints_when_ready_needs_no_runtime() {
        let f = fixture();
        let outcome = handled(&f, Packet::request("E", "apis", "getEndpoints"));
        assert!(matches!(outcome, Outcome::Responded));

        let sent = f.participant.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, Some(MsgId::from("E")));
        assert_eq!(
            sent[0].entity,
            Some(json!([{
                "name": "names.api",
                "rel": "ozp:names",
                "path": "https://bus.local/api/names",
            }]))
        );
    }

    #[test]
    fn test_get_endpoints_before_ready_needs_runtime() {
        let (_trigger, signal) = readiness();
        let f = fixture_with(signal);
        let result = f
            .debugger
            .handle_transport_packet(Packet::request("E", "apis", "getEndpoints"));
        assert!(matches!(result, Err(TapError::NoRuntime)));
        assert!(f.participant.sent().is_empty());
    }

    #[tokio::test]
    async fn test_get_endpoints_after_trigger_fires_is_inline() {
        let (trigger, signal) = readiness();
        let f = fixture_with(signal);
        trigger.mark_ready();

        let outcome = handled(&f, Packet::request("E", "apis", "getEndpoints"));
        assert!(matches!(outcome, Outcome::Responded));
        assert_eq!(f.participant.take_sent().len(), 1);
    }

    #[tokio::test]
    async fn test_get_endpoints_waits_for_readiness() {
        let (trigger, signal) = readiness();
        let f = fixture_with(signal);

        let first = handled(&f, Packet::request("E1", "apis", "getEndpoints"));
        let second = handled(&f, Packet::request("E2", "apis", "getEndpoints"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.participant.sent().is_empty());

        // Other requests are not held up by the pending gathers.
        handled(&f, Packet::request("M", "metrics", "getAll"));
        assert_eq!(f.participant.take_sent().len(), 1);

        trigger.mark_ready();
        first.finish().await.unwrap();
        second.finish().await.unwrap();

        let mut reply_to: Vec<_> = f
            .participant
            .take_sent()
            .into_iter()
            .filter_map(|p| p.reply_to)
            .collect();
        reply_to.sort();
        assert_eq!(reply_to, vec![MsgId::from("E1"), MsgId::from("E2")]);
    }

    #[test]
    fn test_dropping_debugger_removes_tap() {
        let f = fixture();
        handled(&f, Packet::request("A", "traffic", "start"));
        let peer = Arc::clone(&f.peer);
        drop(f);

        assert_eq!(peer.handler_count(PeerEventKind::Send), 0);
        assert_eq!(peer.handler_count(PeerEventKind::Receive), 0);
    }

    #[test]
    fn test_debuggers_do_not_share_watches() {
        let f = fixture();
        let other_participant = Arc::new(RecordingParticipant::new());
        let other = Debugger::new(
            Arc::clone(&other_participant),
            Arc::clone(&f.peer) as Arc<dyn Peer>,
            Wiring {
                metrics: Arc::new(MetricRegistry::new()),
                apis: Arc::new(EndpointTable::new()),
                readiness: Readiness::none(),
            },
            DebuggerConfig::default(),
        );

        handled(&f, Packet::request("A", "traffic", "start"));
        other
            .handle_transport_packet(Packet::request("B", "traffic", "start"))
            .unwrap();
        f.participant.take_sent();
        other_participant.take_sent();

        f.peer.emit(PeerEventKind::Send, Packet::default());

        let mine = f.participant.take_sent();
        let theirs = other_participant.take_sent();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].reply_to, Some(MsgId::from("A")));
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].reply_to, Some(MsgId::from("B")));
    }
}
