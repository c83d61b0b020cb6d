//! Metrics interface.
//!
//! The core consumes a [`MetricsSink`] and never a concrete backend.
//! [`InMemoryMetrics`] exists for tests and for the default runtime;
//! production deployments plug their own sink in.

use dashmap::DashMap;
use std::sync::Arc;

/// Pluggable metrics backend.
pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &str, delta: u64);
    fn gauge(&self, name: &str, value: f64);
    fn histogram(&self, name: &str, value: f64);
}

/// Sink that drops everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn histogram(&self, _name: &str, _value: f64) {}
}

/// In-memory sink keyed by series name. Readable back, which is what the
/// invariant tests need.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Vec<f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.histograms
            .get(name)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, delta: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

/// Clonable handle wrapping the configured sink. When metrics are disabled
/// the handle short-circuits before touching the sink.
#[derive(Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
    enabled: bool,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>, enabled: bool) -> Self {
        Metrics { sink, enabled }
    }

    pub fn disabled() -> Self {
        Metrics {
            sink: Arc::new(NoopMetrics),
            enabled: false,
        }
    }

    pub fn incr(&self, name: &str) {
        self.counter(name, 1);
    }

    pub fn counter(&self, name: &str, delta: u64) {
        if self.enabled {
            self.sink.counter(name, delta);
        }
    }

    pub fn gauge(&self, name: &str, value: f64) {
        if self.enabled {
            self.sink.gauge(name, value);
        }
    }

    pub fn histogram(&self, name: &str, value: f64) {
        if self.enabled {
            self.sink.histogram(name, value);
        }
    }
}
