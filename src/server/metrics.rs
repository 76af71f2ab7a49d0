//! Prometheus metrics for the experiment engine
//!
//! - `kokeilu_lifecycle_operations_total{operation, outcome}`
//! - `kokeilu_lifecycle_operation_duration_seconds{operation}`
//! - `kokeilu_iteration_results_total{outcome}`

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub struct EngineMetrics {
    registry: Registry,
    lifecycle_operations: IntCounterVec,
    operation_duration: HistogramVec,
    iteration_results: IntCounterVec,
}

pub type SharedMetrics = Arc<EngineMetrics>;

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let lifecycle_operations = IntCounterVec::new(
            Opts::new(
                "kokeilu_lifecycle_operations_total",
                "Lifecycle operations by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "kokeilu_lifecycle_operation_duration_seconds",
                "Lifecycle operation latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )?;
        let iteration_results = IntCounterVec::new(
            Opts::new(
                "kokeilu_iteration_results_total",
                "Iteration result entries by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(lifecycle_operations.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(iteration_results.clone()))?;

        Ok(Self {
            registry,
            lifecycle_operations,
            operation_duration,
            iteration_results,
        })
    }

    /// Record one lifecycle call; `outcome` is "success" or an error kind
    pub fn record_operation(&self, operation: &str, outcome: &str, duration_secs: f64) {
        self.lifecycle_operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    /// Record one batch entry: "data", "no_data", "not_found" or "unavailable"
    pub fn record_iteration_result(&self, outcome: &str) {
        self.iteration_results.with_label_values(&[outcome]).inc();
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(EngineMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_operation() {
        let metrics = create_metrics().expect("registry");
        metrics.record_operation("start_iteration", "success", 0.002);
        metrics.record_operation("start_iteration", "conflict", 0.001);

        let text = metrics.encode().expect("encode");
        assert!(text.contains("kokeilu_lifecycle_operations_total"));
        assert!(text.contains(r#"operation="start_iteration",outcome="conflict""#));
        assert!(text.contains("kokeilu_lifecycle_operation_duration_seconds_bucket"));
    }

    #[test]
    fn test_iteration_results_counter() {
        let metrics = create_metrics().expect("registry");
        metrics.record_iteration_result("not_found");
        metrics.record_iteration_result("not_found");

        let text = metrics.encode().expect("encode");
        assert!(text.contains(r#"kokeilu_iteration_results_total{outcome="not_found"} 2"#));
    }
}
