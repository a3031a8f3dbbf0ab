//! Error type shared by the tap components.

use thiserror::Error;

/// Errors raised while serving administrative requests or notifications.
///
/// None of these leave the watch registry inconsistent: tap state is derived
/// from the entry table alone.
#[derive(Debug, Error)]
pub enum TapError {
    /// The participant could not deliver a packet.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Some watchers did not receive a notification.
    #[error("Fan-out incomplete: {failed} of {attempted} notifications failed")]
    FanoutIncomplete {
        /// Number of failed deliveries.
        failed: usize,
        /// Number of watchers notified.
        attempted: usize,
    },

    /// A metric getter failed.
    #[error("Metric {name} failed: {reason}")]
    Metric {
        /// Metric name.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// A metric name is already taken by a metric of another kind.
    #[error("Metric {0} is registered with a different type")]
    MetricType(String),

    /// An endpoint link could not be resolved.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// A payload could not be converted to JSON.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Wire protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tap_protocol::ProtocolError),

    /// A deferred request was issued outside a tokio runtime.
    #[error("No async runtime available for deferred request")]
    NoRuntime,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
