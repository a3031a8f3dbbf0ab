//! Pull-based metrics registry.
//!
//! Metrics are registered by name and read on demand: a snapshot calls each
//! metric's getter at the time of the snapshot.

use crate::error::TapError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A readable metric.
pub trait Metric: Send + Sync {
    /// Compute the current value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be computed.
    fn get(&self) -> Result<Value, TapError>;
}

/// Anything that can enumerate its metrics.
pub trait MetricsSource: Send + Sync {
    /// Every known metric, by name.
    fn all_metrics(&self) -> Vec<(String, Arc<dyn Metric>)>;
}

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn get(&self) -> Result<Value, TapError> {
        Ok(json!(self.count()))
    }
}

/// Event count plus its mean rate since creation.
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    started: Instant,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl Meter {
    /// Record `n` events.
    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Total events recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean events per second since creation.
    #[must_use]
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.count() as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Metric for Meter {
    fn get(&self) -> Result<Value, TapError> {
        Ok(json!({ "count": self.count(), "meanRate": self.mean_rate() }))
    }
}

/// Metric backed by a getter closure.
pub struct Gauge<F> {
    getter: F,
}

impl<F> Gauge<F>
where
    F: Fn() -> Result<Value, TapError> + Send + Sync,
{
    /// Create a gauge from a fallible getter.
    pub fn new(getter: F) -> Self {
        Self { getter }
    }
}

impl<F> Metric for Gauge<F>
where
    F: Fn() -> Result<Value, TapError> + Send + Sync,
{
    fn get(&self) -> Result<Value, TapError> {
        (self.getter)()
    }
}

enum Registered {
    Counter(Arc<Counter>),
    Meter(Arc<Meter>),
    Other(Arc<dyn Metric>),
}

impl Registered {
    fn as_metric(&self) -> Arc<dyn Metric> {
        match self {
            Registered::Counter(c) => Arc::clone(c) as Arc<dyn Metric>,
            Registered::Meter(m) => Arc::clone(m) as Arc<dyn Metric>,
            Registered::Other(m) => Arc::clone(m),
        }
    }
}

/// Named metrics.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: DashMap<String, Registered>,
}

impl MetricRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::MetricType`] if `name` holds another kind of metric.
    pub fn counter(&self, name: &str) -> Result<Arc<Counter>, TapError> {
        match self
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Registered::Counter(Arc::default()))
            .value()
        {
            Registered::Counter(c) => Ok(Arc::clone(c)),
            _ => Err(TapError::MetricType(name.to_string())),
        }
    }

    /// Get or create the meter `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::MetricType`] if `name` holds another kind of metric.
    pub fn meter(&self, name: &str) -> Result<Arc<Meter>, TapError> {
        match self
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Registered::Meter(Arc::default()))
            .value()
        {
            Registered::Meter(m) => Ok(Arc::clone(m)),
            _ => Err(TapError::MetricType(name.to_string())),
        }
    }

    /// Register a gauge computed by `getter`, replacing any previous gauge.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::MetricType`] if `name` is a counter or meter.
    pub fn gauge<F>(&self, name: &str, getter: F) -> Result<(), TapError>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.register(name, Arc::new(Gauge::new(move || Ok(getter()))))
    }

    /// Register an arbitrary metric under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::MetricType`] if `name` is a counter or meter.
    pub fn register(&self, name: &str, metric: Arc<dyn Metric>) -> Result<(), TapError> {
        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(mut entry) => match entry.get() {
                Registered::Other(_) => {
                    entry.insert(Registered::Other(metric));
                    Ok(())
                }
                _ => Err(TapError::MetricType(name.to_string())),
            },
            Entry::Vacant(entry) => {
                entry.insert(Registered::Other(metric));
                Ok(())
            }
        }
    }

    /// Number of registered metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Check if no metrics are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl MetricsSource for MetricRegistry {
    fn all_metrics(&self) -> Vec<(String, Arc<dyn Metric>)> {
        let mut all: Vec<_> = self
            .metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().as_metric()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_shared_by_name() {
        let registry = MetricRegistry::new();
        registry.counter("packets").unwrap().inc();
        registry.counter("packets").unwrap().inc_by(2);

        assert_eq!(registry.counter("packets").unwrap().count(), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_kind_conflicts_are_rejected() {
        let registry = MetricRegistry::new();
        registry.counter("x").unwrap();

        assert!(matches!(registry.meter("x"), Err(TapError::MetricType(_))));
        assert!(registry.gauge("x", || json!(1)).is_err());
    }

    #[test]
    fn test_gauge_is_read_at_snapshot_time() {
        let registry = MetricRegistry::new();
        let source = Arc::new(AtomicU64::new(1));
        let reading = Arc::clone(&source);
        registry
            .gauge("depth", move || json!(reading.load(Ordering::Relaxed)))
            .unwrap();

        source.store(5, Ordering::Relaxed);
        let all = registry.all_metrics();
        assert_eq!(all[0].1.get().unwrap(), json!(5));
    }

    #[test]
    fn test_all_metrics_sorted_by_name() {
        let registry = MetricRegistry::new();
        registry.counter("b").unwrap();
        registry.meter("a").unwrap().mark(4);

        let names: Vec<_> = registry.all_metrics().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);

        let meter = registry.meter("a").unwrap().get().unwrap();
        assert_eq!(meter["count"], 4);
    }
}
