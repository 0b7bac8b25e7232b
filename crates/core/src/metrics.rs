//! Prometheus metrics for the core pipeline.
//!
//! Overload and drop policies are observable: every dropped fan-out
//! message, rejected audit write, and retried batch shows up here. The
//! hosting process constructs one [`MetricsRegistry`] and threads it
//! through the component constructors; there is no process-wide registry.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

/// Explicit registry owned by the hosting process.
pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn register<T>(&self, collector: T) -> Result<(), prometheus::Error>
    where
        T: prometheus::core::Collector + 'static,
    {
        self.registry.register(Box::new(collector))
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render the registry as Prometheus text exposition format.
    pub fn metrics_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters shared by the core services.
pub struct CoreMetrics {
    pub audit_overflow_total: IntCounter,
    pub audit_flush_failures_total: IntCounter,
    pub bus_publish_failures_total: IntCounter,
    pub batch_write_retries_total: IntCounter,
    pub batch_write_failures_total: IntCounter,
    pub fanout_dropped_total: IntCounter,
    pub fanout_evictions_total: IntCounter,
    pub patterns_detected_total: IntCounter,
    pub alerts_created_total: IntCounter,
}

impl CoreMetrics {
    /// Create the counters and register them in `registry`.
    pub fn new(registry: &MetricsRegistry) -> Arc<Self> {
        let metrics = Self::build();
        for collector in metrics.collectors() {
            if let Err(e) = registry.registry.register(collector) {
                warn!(error = %e, "failed to register metric");
            }
        }
        Arc::new(metrics)
    }

    /// Counters without registry registration. Test helper.
    pub fn new_unregistered() -> Arc<Self> {
        Arc::new(Self::build())
    }

    fn build() -> Self {
        Self {
            audit_overflow_total: counter(
                "aegis_audit_overflow_total",
                "Audit writes rejected because the buffer was full",
            ),
            audit_flush_failures_total: counter(
                "aegis_audit_flush_failures_total",
                "Audit batches that failed to reach durable storage",
            ),
            bus_publish_failures_total: counter(
                "aegis_bus_publish_failures_total",
                "Event publishes that failed after retry",
            ),
            batch_write_retries_total: counter(
                "aegis_batch_write_retries_total",
                "Transient graph-store batch write retries",
            ),
            batch_write_failures_total: counter(
                "aegis_batch_write_failures_total",
                "Batches that failed permanently",
            ),
            fanout_dropped_total: counter(
                "aegis_fanout_dropped_total",
                "Messages dropped for slow realtime observers",
            ),
            fanout_evictions_total: counter(
                "aegis_fanout_evictions_total",
                "Realtime observers evicted for full buffers",
            ),
            patterns_detected_total: counter(
                "aegis_patterns_detected_total",
                "Pattern matches emitted after dedupe",
            ),
            alerts_created_total: counter(
                "aegis_alerts_created_total",
                "Alerts opened from pattern detections",
            ),
        }
    }

    fn collectors(&self) -> Vec<Box<dyn prometheus::core::Collector>> {
        vec![
            Box::new(self.audit_overflow_total.clone()),
            Box::new(self.audit_flush_failures_total.clone()),
            Box::new(self.bus_publish_failures_total.clone()),
            Box::new(self.batch_write_retries_total.clone()),
            Box::new(self.batch_write_failures_total.clone()),
            Box::new(self.fanout_dropped_total.clone()),
            Box::new(self.fanout_evictions_total.clone()),
            Box::new(self.patterns_detected_total.clone()),
            Box::new(self.alerts_created_total.clone()),
        ]
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    // Name and help are compile-time constants; construction cannot fail.
    IntCounter::new(name, help).expect("valid metric descriptor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let metrics = CoreMetrics::new_unregistered();
        metrics.audit_overflow_total.inc();
        metrics.audit_overflow_total.inc();
        assert_eq!(metrics.audit_overflow_total.get(), 2);
    }

    #[test]
    fn registered_counters_appear_in_text_exposition() {
        let registry = MetricsRegistry::new();
        let metrics = CoreMetrics::new(&registry);
        metrics.patterns_detected_total.inc();

        let text = registry.metrics_text();
        assert!(text.contains("aegis_patterns_detected_total 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();
        let metrics = CoreMetrics::new(&a);
        metrics.alerts_created_total.inc();

        assert!(a.metrics_text().contains("aegis_alerts_created_total"));
        assert!(!b.metrics_text().contains("aegis_alerts_created_total"));
    }
}
