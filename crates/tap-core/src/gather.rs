//! Read-only gathers behind `metrics getAll` and `apis getEndpoints`.

use crate::endpoints::{ApiRegistry, EndpointDescriptor};
use crate::error::TapError;
use crate::metrics::MetricsSource;
use crate::readiness::Readiness;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of one metric at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,
    /// Current value.
    pub value: Value,
}

/// Read every metric.
///
/// # Errors
///
/// The first failing getter aborts the snapshot.
pub fn metric_snapshot(source: &dyn MetricsSource) -> Result<Vec<MetricSample>, TapError> {
    source
        .all_metrics()
        .into_iter()
        .map(|(name, metric)| {
            let value = metric.get()?;
            Ok(MetricSample { name, value })
        })
        .collect()
}

/// List every endpoint of every API once `readiness` has settled.
///
/// # Errors
///
/// Returns an error if an endpoint link cannot be resolved.
pub async fn endpoint_snapshot(
    apis: &dyn ApiRegistry,
    readiness: &Readiness,
) -> Result<Vec<EndpointDescriptor>, TapError> {
    readiness.wait().await;
    list_endpoints(apis)
}

/// List every endpoint of every API as registered right now.
///
/// # Errors
///
/// Returns an error if an endpoint link cannot be resolved.
pub fn list_endpoints(apis: &dyn ApiRegistry) -> Result<Vec<EndpointDescriptor>, TapError> {
    let mut descriptors = Vec::new();
    for api in apis.apis() {
        for endpoint_ref in &api.endpoints {
            let endpoint = apis.resolve(&endpoint_ref.link)?;
            descriptors.push(EndpointDescriptor {
                name: api.name.clone(),
                rel: endpoint.name,
                path: endpoint.base_url,
            });
        }
    }
    Ok(descriptors)
}
