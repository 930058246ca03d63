//! Per-test execution metrics.

use crate::observability::MetricsPipeline;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TEST_DURATION_METRIC: &str = "test_duration_seconds";
pub const TEST_EXECUTED_METRIC: &str = "test_executed_total";
pub const TEST_ERRORS_METRIC: &str = "test_errors_total";

/// Attribute key identifying the test.
pub const TEST_NAME_LABEL: &str = "test_name";

struct Instruments {
    duration: Histogram<f64>,
    executed: Counter<u64>,
    errors: Counter<u64>,
}

/// Records one observation per completed test.
///
/// Cheap to clone; clones share the same instruments. The OpenTelemetry instruments
/// are safe to update from many tasks at once.
#[derive(Clone)]
pub struct MetricsCollector {
    instruments: Option<Arc<Instruments>>,
}

impl MetricsCollector {
    /// Create the instruments on `pipeline`'s meter.
    pub fn new(pipeline: &MetricsPipeline) -> Self {
        let meter = pipeline.meter();

        let duration = meter
            .f64_histogram(TEST_DURATION_METRIC)
            .with_description("Duration of test execution in seconds")
            .init();
        let executed = meter
            .u64_counter(TEST_EXECUTED_METRIC)
            .with_description("Total number of tests executed")
            .init();
        let errors = meter
            .u64_counter(TEST_ERRORS_METRIC)
            .with_description("Total number of test errors")
            .init();

        info!("Metrics collector initialized successfully");
        Self {
            instruments: Some(Arc::new(Instruments {
                duration,
                executed,
                errors,
            })),
        }
    }

    /// Collector that drops every observation with a warning.
    pub fn disabled() -> Self {
        Self { instruments: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.instruments.is_some()
    }

    /// Record a completed test.
    ///
    /// Metrics: `test_executed_total`, `test_duration_seconds`, and `test_errors_total`
    /// when `failed`. All three carry the `test_name` attribute.
    pub fn record_test_execution(&self, test_name: &str, duration: Duration, failed: bool) {
        let Some(instruments) = &self.instruments else {
            warn!(
                test = %test_name,
                "Metrics collector not initialized, skipping metrics for test"
            );
            return;
        };

        let attributes = [KeyValue::new(TEST_NAME_LABEL, test_name.to_string())];

        instruments.executed.add(1, &attributes);
        instruments
            .duration
            .record(duration.as_secs_f64(), &attributes);

        if failed {
            instruments.errors.add(1, &attributes);
            info!(test = %test_name, "Recorded test error");
        }

        debug!(
            test = %test_name,
            duration_seconds = duration.as_secs_f64(),
            failed,
            "Recorded test metrics"
        );
    }
}
