//! Prometheus metrics for meshsync.
//!
//! Metric names live here as constants. Recording goes through a
//! [`MetricsSink`] handed to the reconciler and drift detector, so tests can
//! observe exactly what was emitted and no process-global recorder is needed.

use std::sync::Arc;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;

/// Total apply runs, labelled `status=success|error`.
pub const APPLY_TOTAL: &str = "meshsync_apply_total";
/// Total drift checks, labelled `has_drift=true|false|error`.
pub const DRIFT_CHECKS_TOTAL: &str = "meshsync_drift_checks_total";
/// Wall time of an apply run in seconds (histogram).
pub const CONFIG_SYNC_DURATION: &str = "meshsync_config_sync_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Where counters and histograms go
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, label: &'static str, value: &'static str);

    fn observe(&self, name: &'static str, value: f64);

    /// Prometheus text exposition, if this sink can produce one
    fn render(&self) -> Option<String> {
        None
    }
}

/// Sink backed by a Prometheus recorder owned by this instance
pub struct PrometheusSink {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(CONFIG_SYNC_DURATION.to_string()),
                DURATION_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }
}

impl MetricsSink for PrometheusSink {
    fn increment(&self, name: &'static str, label: &'static str, value: &'static str) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(name, label => value).increment(1);
        });
    }

    fn observe(&self, name: &'static str, value: f64) {
        metrics::with_local_recorder(&self.recorder, || {
            histogram!(name).record(value);
        });
    }

    fn render(&self) -> Option<String> {
        Some(self.handle.render())
    }
}

/// A recorded metric event
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Increment {
        name: &'static str,
        label: &'static str,
        value: &'static str,
    },
    Observe {
        name: &'static str,
        value: f64,
    },
}

/// Sink that keeps every event in memory
#[derive(Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Number of increments of `name` with `label=value`
    pub fn count(&self, name: &str, label: &str, value: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                matches!(e, MetricEvent::Increment { name: n, label: l, value: v }
                    if *n == name && *l == label && *v == value)
            })
            .count()
    }

    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::Observe { name: n, value } if *n == name => Some(*value),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &'static str, label: &'static str, value: &'static str) {
        self.events
            .lock()
            .push(MetricEvent::Increment { name, label, value });
    }

    fn observe(&self, name: &'static str, value: f64) {
        self.events.lock().push(MetricEvent::Observe { name, value });
    }
}
