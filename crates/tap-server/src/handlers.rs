//! Connection handlers for tapd.
//!
//! This module handles the connection lifecycle and packet processing.

use crate::bus::{Bus, ConnectionParticipant, Ingress};
use crate::config::Config;
use crate::metrics::{self, ParticipantMetrics};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tap_core::{
    dispatch, readiness, Debugger, DebuggerConfig, EndpointTable, MetricRegistry, Outcome,
    Participant, Readiness, Wiring,
};
use tap_protocol::{codec, Packet, PacketCodec, ProtocolError, PROTOCOL_VERSION};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message bus.
    pub bus: Bus,
    /// Collaborators shared by every debugger.
    pub wiring: Wiring,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus metrics cannot be registered.
    pub fn new(config: Config, apis: Arc<EndpointTable>, readiness: Readiness) -> Result<Self> {
        let registry = Arc::new(MetricRegistry::new());
        let bus = Bus::new(&registry, config.limits.outbound_queue)?;

        Ok(Self {
            bus,
            wiring: Wiring {
                metrics: registry,
                apis,
                readiness,
            },
            config,
        })
    }

    fn debugger_config(&self) -> DebuggerConfig {
        DebuggerConfig {
            sender: self.config.transport.sender.clone(),
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let apis = Arc::new(EndpointTable::new());
    let (trigger, signal) = readiness();
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&apis), signal)?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Endpoint discovery runs in the background; getEndpoints waits for it.
    tokio::spawn({
        let config = config.clone();
        async move {
            config.populate_endpoints(&apis);
            info!(apis = apis.api_count(), "Endpoint discovery complete");
            trigger.mark_ready();
        }
    });

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("tapd listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "participants": state.bus.len(),
        "endpointsReady": state.wiring.readiness.is_ready(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Encoding used for replies on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Json,
    MsgPack,
}

impl WireFormat {
    fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::MsgPack => "msgpack",
        }
    }
}

/// Why a binary frame ended the connection.
#[derive(Debug)]
enum FrameError {
    /// Buffered bytes of an unfinished packet exceed the size limit.
    TooLarge(usize),
    /// The length-prefixed stream is corrupt.
    Protocol(ProtocolError),
}

/// Feed a binary frame into the connection's codec.
///
/// `limit` applies both to the frame and to whatever remains buffered of a
/// packet split across frames.
fn read_binary(
    codec: &mut PacketCodec,
    data: &[u8],
    limit: usize,
) -> Result<Vec<Packet>, FrameError> {
    if data.len() > limit {
        return Err(FrameError::TooLarge(data.len()));
    }
    let packets = codec.feed(data).map_err(FrameError::Protocol)?;
    if codec.pending() > limit {
        return Err(FrameError::TooLarge(codec.pending()));
    }
    Ok(packets)
}

/// Metrics label for a transport-bound packet.
fn admin_route(packet: &Packet) -> &'static str {
    match packet.resource.as_deref() {
        None => "generic",
        Some(resource) => dispatch::route(resource, packet.action.as_deref().unwrap_or_default())
            .map_or("unknown", |route| route.as_str()),
    }
}

fn encode_packet(format: WireFormat, packet: &Packet) -> Result<Message, ProtocolError> {
    match format {
        WireFormat::Json => Ok(Message::Text(codec::encode_json(packet)?)),
        WireFormat::MsgPack => Ok(Message::Binary(codec::encode(packet)?.to_vec())),
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let limit = state.config.limits.max_connections;
    let Some((participant, mut outbound)) = state.bus.admit(&state.config.transport.sender, limit)
    else {
        warn!(limit, "Connection limit reached, refusing participant");
        metrics::record_refused();
        return;
    };

    let mut participant_metrics = ParticipantMetrics::attach();
    let connection_id = participant.address().to_string();
    let debugger = Debugger::new(
        Arc::clone(&participant),
        state.bus.peer(),
        state.wiring.clone(),
        state.debugger_config(),
    );

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut format = WireFormat::Json;
    let mut codec = PacketCodec::new();
    let max_message_size = state.config.limits.max_message_size;

    // Tell the client its bus address
    if participant
        .send_to_recipient(participant.greeting(None))
        .is_err()
    {
        error!(connection = %connection_id, "Failed to queue greeting");
    }

    loop {
        tokio::select! {
            biased;

            // Packets queued for this client
            Some(packet) = outbound.recv() => {
                match encode_packet(format, &packet) {
                    Ok(message) => {
                        metrics::record_frame("outbound", format.as_str(), message_len(&message));
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Failed to encode packet");
                        metrics::record_error("encode");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        format = WireFormat::Json;
                        if text.len() > max_message_size {
                            warn!(connection = %connection_id, size = text.len(), "Frame too large");
                            metrics::record_error("frame_too_large");
                            continue;
                        }
                        metrics::record_frame("inbound", format.as_str(), text.len());

                        match codec::decode_json(&text) {
                            Ok(packet) => handle_packet(&state, &participant, &debugger, packet),
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Undecodable packet");
                                metrics::record_error("decode");
                            }
                        }
                        participant_metrics.set_watches(debugger.watches().len());
                        metrics::record_frame_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        format = WireFormat::MsgPack;
                        metrics::record_frame("inbound", format.as_str(), data.len());

                        // Binary framing cannot resume after a rejected frame.
                        match read_binary(&mut codec, &data, max_message_size) {
                            Ok(packets) => {
                                for packet in packets {
                                    handle_packet(&state, &participant, &debugger, packet);
                                }
                            }
                            Err(FrameError::TooLarge(size)) => {
                                warn!(connection = %connection_id, size, "Packet too large");
                                metrics::record_error("frame_too_large");
                                break;
                            }
                            Err(FrameError::Protocol(e)) => {
                                warn!(connection = %connection_id, error = %e, "Undecodable frame");
                                metrics::record_error("decode");
                                break;
                            }
                        }
                        participant_metrics.set_watches(debugger.watches().len());
                        metrics::record_frame_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.bus.disconnect(&connection_id);
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded packet from `participant`'s client.
fn handle_packet(
    state: &AppState,
    participant: &ConnectionParticipant,
    debugger: &Debugger<ConnectionParticipant>,
    packet: Packet,
) {
    if !PROTOCOL_VERSION.accepts(packet.ver) {
        warn!(connection = %participant.address(), ver = ?packet.ver, "Unsupported packet version");
        metrics::record_error("version");
        return;
    }

    match state.bus.ingest(participant.address(), packet) {
        Ok(Ingress::Routed) => metrics::record_routed(true),
        Ok(Ingress::Transport(packet)) => handle_admin(participant.address(), debugger, packet),
        Err(e) => {
            debug!(connection = %participant.address(), error = %e, "Packet not routed");
            metrics::record_routed(false);
        }
    }
}

/// Hand a transport-bound packet to the connection's debugger.
fn handle_admin(
    connection_id: &str,
    debugger: &Debugger<ConnectionParticipant>,
    packet: Packet,
) {
    let route = admin_route(&packet);
    match debugger.handle_transport_packet(packet) {
        Ok(outcome) => {
            metrics::record_admin_request(route, outcome.as_str());
            if let Outcome::Pending(_) = outcome {
                let connection_id = connection_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = outcome.finish().await {
                        warn!(connection = %connection_id, error = %e, "Deferred administrative request failed");
                        metrics::record_error("admin");
                    }
                });
            }
        }
        Err(e) => {
            warn!(connection = %connection_id, route, error = %e, "Administrative request failed");
            metrics::record_admin_request(route, "failed");
        }
    }
}
