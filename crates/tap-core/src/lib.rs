//! # tap-core
//!
//! Debug tap multiplexer and administrative packet router for the tapline bus.
//!
//! This crate provides the pieces behind the transport's administrative
//! address:
//!
//! - **Watch** - Registry of traffic watches and the peer tap they share
//! - **Fan-out** - One `changed` notification per watcher per intercepted packet
//! - **Dispatch** - Static `(resource, action)` routing table
//! - **Gather** - Metrics and endpoint snapshots
//! - **Debugger** - Ties the above to a participant
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Participant │────▶│  Debugger   │────▶│   Gather    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Fan-out   │◀────│    Peer     │◀────│    Watch    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod debugger;
pub mod dispatch;
pub mod endpoints;
pub mod error;
pub mod fanout;
pub mod gather;
pub mod metrics;
pub mod participant;
pub mod peer;
pub mod readiness;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use debugger::{Debugger, DebuggerConfig, Wiring};
pub use dispatch::{Outcome, Resource, Route};
pub use endpoints::{ApiRegistry, Endpoint, EndpointDescriptor, EndpointTable};
pub use error::TapError;
pub use gather::MetricSample;
pub use metrics::{Counter, Gauge, Meter, Metric, MetricRegistry, MetricsSource};
pub use participant::Participant;
pub use peer::{HandlerId, LocalPeer, Peer, PeerEvent, PeerEventKind, PeerHandler};
pub use readiness::{readiness, Readiness, ReadinessTrigger};
pub use watch::{WatchEntry, WatchRegistry};
