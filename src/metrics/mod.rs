/*!
 * # Metrics Module
 *
 * In-process counters and gauges for the capture and detection pipeline,
 * exposed in Prometheus text format at `/metrics` and as JSON at `/metrics/json`.
 */

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const FRAMES_CAPTURED: &str = "firewatch_frames_captured_total";
pub const FRAMES_DROPPED: &str = "firewatch_frames_dropped_total";
pub const CAPTURE_FAILURES: &str = "firewatch_capture_read_failures_total";
pub const CAPTURE_RECONNECTS: &str = "firewatch_capture_reconnects_total";
pub const FRAMES_ANALYZED: &str = "firewatch_frames_analyzed_total";
pub const DETECTOR_ERRORS: &str = "firewatch_detector_errors_total";
pub const DETECTION_CHANGES: &str = "firewatch_detection_changes_total";
pub const ALERTS_DISPATCHED: &str = "firewatch_alerts_dispatched_total";
pub const ALERT_FAILURES: &str = "firewatch_alert_failures_total";
pub const ACTIVE_SESSION: &str = "firewatch_session_active";
pub const CURRENT_FIRE: &str = "firewatch_current_fire";
pub const CURRENT_SMOKE: &str = "firewatch_current_smoke";
pub const EVENTS_DROPPED: &str = "firewatch_events_dropped_total";
pub const RECORDS_PRUNED: &str = "firewatch_records_pruned_total";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge stored as the bit pattern of an `f64`
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicU64>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Counter>,
    gauges: DashMap<String, Gauge>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_counter(&self, name: &str) -> Counter {
        self.counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .clone()
    }

    pub fn get_or_create_gauge(&self, name: &str) -> Gauge {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .clone()
    }

    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        use std::fmt::Write;

        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect();
        counters.sort();

        let mut gauges: Vec<(String, f64)> = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));

        let mut output = String::new();
        for (name, value) in counters {
            writeln!(output, "# TYPE {} counter", name)
                .and_then(|_| writeln!(output, "{} {}", name, value))
                .map_err(|e| MetricsError::ExportError(e.to_string()))?;
        }
        for (name, value) in gauges {
            writeln!(output, "# TYPE {} gauge", name)
                .and_then(|_| writeln!(output, "{} {}", name, value))
                .map_err(|e| MetricsError::ExportError(e.to_string()))?;
        }

        Ok(output)
    }

    pub fn export_metrics_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), json!(entry.value().get())))
            .collect();
        let gauges: serde_json::Map<String, serde_json::Value> = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), json!(entry.value().get())))
            .collect();

        json!({
            "counters": counters,
            "gauges": gauges,
        })
    }
}

// Global metrics registry
lazy_static::lazy_static! {
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

pub fn increment_counter(name: &str) {
    METRICS.get_or_create_counter(name).inc();
}

pub fn increment_counter_by(name: &str, value: u64) {
    METRICS.get_or_create_counter(name).inc_by(value);
}

pub fn set_gauge(name: &str, value: f64) {
    METRICS.get_or_create_gauge(name).set(value);
}

pub async fn metrics_handler() -> Result<String, MetricsError> {
    METRICS.export_metrics()
}

pub async fn metrics_json_handler() -> serde_json::Value {
    METRICS.export_metrics_json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_render_as_prometheus_text() {
        let registry = MetricsRegistry::new();
        registry.get_or_create_counter("frames_total").inc_by(3);
        registry.get_or_create_gauge("session_active").set(1.0);

        let text = registry.export_metrics().unwrap();
        assert!(text.contains("# TYPE frames_total counter\nframes_total 3\n"));
        assert!(text.contains("# TYPE session_active gauge\nsession_active 1\n"));
    }

    #[test]
    fn gauge_round_trips_fractional_values() {
        let gauge = Gauge::new();
        gauge.set(12.5);
        assert_eq!(gauge.get(), 12.5);
    }

    #[test]
    fn json_export_groups_by_kind() {
        let registry = MetricsRegistry::new();
        registry.get_or_create_counter("alerts").inc();
        let json = registry.export_metrics_json();
        assert_eq!(json["counters"]["alerts"], 1);
        assert!(json["gauges"].as_object().unwrap().is_empty());
    }
}
