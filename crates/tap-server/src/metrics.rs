//! Prometheus export for tapd.
//!
//! These are push metrics recorded through the `metrics` facade. The pull
//! metrics answered by `metrics getAll` live in the bus's `MetricRegistry`.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const PARTICIPANTS_ADMITTED: &str = "tapd_participants_admitted_total";
    pub const PARTICIPANTS_REFUSED: &str = "tapd_participants_refused_total";
    pub const PARTICIPANTS_ATTACHED: &str = "tapd_participants_attached";
    pub const FRAMES_TOTAL: &str = "tapd_frames_total";
    pub const FRAME_BYTES: &str = "tapd_frame_bytes_total";
    pub const FRAME_SECONDS: &str = "tapd_frame_seconds";
    pub const ROUTED_TOTAL: &str = "tapd_routed_packets_total";
    pub const ADMIN_REQUESTS_TOTAL: &str = "tapd_admin_requests_total";
    pub const WATCHES_ACTIVE: &str = "tapd_traffic_watches";
    pub const ERRORS_TOTAL: &str = "tapd_errors_total";
}

enum Kind {
    Counter,
    Gauge,
    Histogram,
}

const DESCRIPTIONS: &[(&str, Kind, &str)] = &[
    (names::PARTICIPANTS_ADMITTED, Kind::Counter, "Participants attached since start"),
    (names::PARTICIPANTS_REFUSED, Kind::Counter, "Upgrades refused at the connection limit"),
    (names::PARTICIPANTS_ATTACHED, Kind::Gauge, "Participants currently on the bus"),
    (names::FRAMES_TOTAL, Kind::Counter, "WebSocket frames by direction and format"),
    (names::FRAME_BYTES, Kind::Counter, "WebSocket frame payload bytes by direction"),
    (names::FRAME_SECONDS, Kind::Histogram, "Time spent handling one inbound frame"),
    (names::ROUTED_TOTAL, Kind::Counter, "Participant-to-participant packets by result"),
    (names::ADMIN_REQUESTS_TOTAL, Kind::Counter, "Transport-bound packets by route and outcome"),
    (names::WATCHES_ACTIVE, Kind::Gauge, "Live traffic watches across all debuggers"),
    (names::ERRORS_TOTAL, Kind::Counter, "Errors by type"),
];

/// Describe every tapd metric to the installed recorder.
pub fn init_metrics() {
    for (name, kind, description) in DESCRIPTIONS {
        match kind {
            Kind::Counter => metrics::describe_counter!(*name, *description),
            Kind::Gauge => metrics::describe_gauge!(*name, *description),
            Kind::Histogram => metrics::describe_histogram!(*name, *description),
        }
    }

    info!(count = DESCRIPTIONS.len(), "Metrics described");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an upgrade refused at the connection limit.
pub fn record_refused() {
    counter!(names::PARTICIPANTS_REFUSED).increment(1);
}

/// Record one WebSocket frame.
pub fn record_frame(direction: &'static str, format: &'static str, bytes: usize) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "format" => format).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long an inbound frame took to handle.
pub fn record_frame_seconds(seconds: f64) {
    histogram!(names::FRAME_SECONDS).record(seconds);
}

/// Record a packet routed between participants.
pub fn record_routed(delivered: bool) {
    let result = if delivered { "delivered" } else { "undeliverable" };
    counter!(names::ROUTED_TOTAL, "result" => result).increment(1);
}

/// Record a transport-bound packet and what became of it.
pub fn record_admin_request(route: &'static str, outcome: &'static str) {
    counter!(names::ADMIN_REQUESTS_TOTAL, "route" => route, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Per-participant accounting, undone on drop.
///
/// Tracks attachment and the participant's share of live traffic watches.
#[derive(Debug)]
pub struct ParticipantMetrics {
    watches: usize,
}

impl ParticipantMetrics {
    /// Record an attached participant.
    #[must_use]
    pub fn attach() -> Self {
        counter!(names::PARTICIPANTS_ADMITTED).increment(1);
        gauge!(names::PARTICIPANTS_ATTACHED).increment(1.0);
        Self { watches: 0 }
    }

    /// Update the participant's live watch count.
    pub fn set_watches(&mut self, watches: usize) {
        let delta = watches as f64 - self.watches as f64;
        if delta != 0.0 {
            gauge!(names::WATCHES_ACTIVE).increment(delta);
        }
        self.watches = watches;
    }

    /// Live watches last reported.
    #[must_use]
    pub fn watches(&self) -> usize {
        self.watches
    }
}

impl Drop for ParticipantMetrics {
    fn drop(&mut self) {
        self.set_watches(0);
        gauge!(names::PARTICIPANTS_ATTACHED).decrement(1.0);
    }
}
