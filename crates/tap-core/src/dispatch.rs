//! Administrative routing table.
//!
//! Administrative packets name a `resource` and an `action`. Both are matched
//! case-insensitively after trimming surrounding whitespace. Pairs missing
//! from [`ROUTES`] are dropped without a response.

use crate::error::TapError;
use std::fmt;
use tokio::task::JoinHandle;

/// Administrative resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Live traffic watching.
    Traffic,
    /// API endpoint discovery.
    Apis,
    /// Metrics snapshots.
    Metrics,
}

impl Resource {
    /// Parse a resource name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "traffic" => Some(Resource::Traffic),
            "apis" => Some(Resource::Apis),
            "metrics" => Some(Resource::Metrics),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Traffic => "traffic",
            Resource::Apis => "apis",
            Resource::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handled administrative request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `traffic` / `start`
    TrafficStart,
    /// `traffic` / `stop`
    TrafficStop,
    /// `apis` / `getEndpoints`
    ApisGetEndpoints,
    /// `metrics` / `getAll`
    MetricsGetAll,
}

impl Route {
    /// `resource.action` label, e.g. `traffic.start`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::TrafficStart => "traffic.start",
            Route::TrafficStop => "traffic.stop",
            Route::ApisGetEndpoints => "apis.getEndpoints",
            Route::MetricsGetAll => "metrics.getAll",
        }
    }
}

/// Every handled `(resource, action)` pair. Actions are lower-case.
pub const ROUTES: &[(Resource, &str, Route)] = &[
    (Resource::Traffic, "start", Route::TrafficStart),
    (Resource::Traffic, "stop", Route::TrafficStop),
    (Resource::Apis, "getendpoints", Route::ApisGetEndpoints),
    (Resource::Metrics, "getall", Route::MetricsGetAll),
];

/// Look up the route for a raw resource/action pair.
#[must_use]
pub fn route(resource: &str, action: &str) -> Option<Route> {
    let resource = Resource::parse(resource)?;
    let action = action.trim().to_lowercase();
    ROUTES
        .iter()
        .find(|(r, a, _)| *r == resource && *a == action)
        .map(|(_, _, route)| *route)
}

/// What happened to a transport-bound packet.
#[derive(Debug)]
pub enum Outcome {
    /// The packet had no resource and went to the participant's generic handler.
    Forwarded,
    /// Unknown resource or action; no response was sent.
    Ignored,
    /// The request was answered.
    Responded,
    /// The response will be sent by a background task once it completes.
    Pending(JoinHandle<Result<(), TapError>>),
}

impl Outcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Forwarded => "forwarded",
            Outcome::Ignored => "ignored",
            Outcome::Responded => "responded",
            Outcome::Pending(_) => "pending",
        }
    }

    /// Wait for a deferred response, if any.
    ///
    /// # Errors
    ///
    /// Returns the deferred request's error, or [`TapError::Internal`] if its
    /// task panicked or was cancelled.
    pub async fn finish(self) -> Result<(), TapError> {
        match self {
            Outcome::Pending(task) => task
                .await
                .map_err(|e| TapError::Internal(format!("deferred request aborted: {e}")))?,
            _ => Ok(()),
        }
    }
}
