//! Prometheus metrics for facade operations

use super::errors::Operation;
use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Operation counters and latencies, on a registry owned by the driver
#[derive(Clone)]
pub struct DriverMetrics {
    registry: Registry,
    operations: IntCounterVec,
    durations: HistogramVec,
}

impl DriverMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new(
                "storagecenter_driver_operations_total",
                "Driver operations by outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "storagecenter_driver_operation_duration_seconds",
                "Driver operation latency",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(durations.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            durations,
        })
    }

    pub fn observe(&self, operation: Operation, outcome: &str, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation.as_str(), outcome])
            .inc();
        self.durations
            .with_label_values(&[operation.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn count(&self, operation: Operation, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation.as_str(), outcome])
            .get()
    }

    /// Text exposition format
    pub fn gather(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_gather() {
        let metrics = DriverMetrics::new().unwrap();
        metrics.observe(Operation::CreateVolume, "success", Duration::from_millis(120));
        metrics.observe(Operation::CreateVolume, "unknown_volume", Duration::from_millis(5));

        assert_eq!(metrics.count(Operation::CreateVolume, "success"), 1);
        let text = metrics.gather().unwrap();
        assert!(text.contains("storagecenter_driver_operations_total"));
        assert!(text.contains("operation=\"create_volume\""));
        assert!(text.contains("storagecenter_driver_operation_duration_seconds_bucket"));
    }
}
