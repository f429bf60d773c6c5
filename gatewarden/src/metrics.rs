// gatewarden/src/metrics.rs
//
// Minimal metrics surface. The engine emits counters and timings through
// this trait; hosts bridge it to whatever telemetry they run.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Metric {
    pub name:   &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value:  f64,
    pub at:     DateTime<Utc>,
}

impl Metric {
    pub fn new(name: &'static str, value: f64) -> Self {
        Self { name, labels: Vec::new(), value, at: Utc::now() }
    }

    pub fn label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: Metric);
}

/// Discards everything. The default when no sink is wired in.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _metric: Metric) {}
}

/// Emits each metric as a debug-level tracing event.
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, metric: Metric) {
        tracing::debug!(
            name = metric.name,
            value = metric.value,
            labels = ?metric.labels,
            "metric"
        );
    }
}
