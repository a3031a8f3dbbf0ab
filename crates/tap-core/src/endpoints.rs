//! API endpoint registry.
//!
//! Each API lists the endpoint links it was discovered under. A link resolves
//! to a concrete endpoint carrying its relation name and base URL.

use crate::error::TapError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Reference to an endpoint by link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Endpoint link.
    pub link: String,
}

/// A registered API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDescriptor {
    /// API name.
    pub name: String,
    /// Endpoints registered under this API.
    pub endpoints: Vec<EndpointRef>,
}

/// A resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Relation name.
    pub name: String,
    /// Base URL.
    pub base_url: String,
}

/// One row of an endpoint discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// API name.
    pub name: String,
    /// Endpoint relation name.
    pub rel: String,
    /// Endpoint base URL.
    pub path: String,
}

/// Registry of APIs and their endpoints.
pub trait ApiRegistry: Send + Sync {
    /// Every registered API.
    fn apis(&self) -> Vec<ApiDescriptor>;

    /// Resolve an endpoint link.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::UnknownEndpoint`] if the link is not known.
    fn resolve(&self, link: &str) -> Result<Endpoint, TapError>;
}

/// In-memory [`ApiRegistry`].
#[derive(Debug, Default)]
pub struct EndpointTable {
    apis: DashMap<String, Vec<EndpointRef>>,
    endpoints: DashMap<String, Endpoint>,
}

impl EndpointTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the endpoint reachable through `link`.
    pub fn register_endpoint(&self, link: impl Into<String>, endpoint: Endpoint) {
        self.endpoints.insert(link.into(), endpoint);
    }

    /// Add `link` to the endpoints of API `api`.
    pub fn attach(&self, api: impl Into<String>, link: impl Into<String>) {
        let link = EndpointRef { link: link.into() };
        let mut endpoints = self.apis.entry(api.into()).or_default();
        if !endpoints.contains(&link) {
            endpoints.push(link);
        }
    }

    /// Number of registered APIs.
    #[must_use]
    pub fn api_count(&self) -> usize {
        self.apis.len()
    }
}

impl ApiRegistry for EndpointTable {
    fn apis(&self) -> Vec<ApiDescriptor> {
        let mut apis: Vec<ApiDescriptor> = self
            .apis
            .iter()
            .map(|e| ApiDescriptor {
                name: e.key().clone(),
                endpoints: e.value().clone(),
            })
            .collect();
        apis.sort_by(|a, b| a.name.cmp(&b.name));
        apis
    }

    fn resolve(&self, link: &str) -> Result<Endpoint, TapError> {
        self.endpoints
            .get(link)
            .map(|e| e.value().clone())
            .ok_or_else(|| TapError::UnknownEndpoint(link.to_string()))
    }
}
