//! In-memory metric inspection for tests.
//!
//! Available to this crate's unit tests and, behind the `test-utils` feature, to
//! integration tests and downstream crates.

#![allow(clippy::expect_used)]

use crate::config::TelemetryConfig;
use crate::observability::collector::{TEST_DURATION_METRIC, TEST_NAME_LABEL};
use crate::observability::MetricsPipeline;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{Histogram, ResourceMetrics, Sum};
use opentelemetry_sdk::metrics::PeriodicReader;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::testing::metrics::InMemoryMetricsExporter;

/// Local metrics pipeline whose output can be read back.
///
/// Flushing blocks while the reader task exports, so tests using this need a
/// multi-thread runtime.
pub struct MetricsCapture {
    pub pipeline: MetricsPipeline,
    exporter: InMemoryMetricsExporter,
}

impl MetricsCapture {
    pub fn new() -> Self {
        let exporter = InMemoryMetricsExporter::default();
        let reader = PeriodicReader::builder(exporter.clone(), runtime::Tokio).build();
        let pipeline = MetricsPipeline::with_reader(&TelemetryConfig::default(), reader);
        Self { pipeline, exporter }
    }

    /// Current cumulative value of counter `metric` for `test_name`.
    pub fn counter(&self, metric: &str, test_name: &str) -> u64 {
        let Some(latest) = self.latest() else {
            return 0;
        };

        latest
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .filter(|m| m.name == metric)
            .filter_map(|m| m.data.as_any().downcast_ref::<Sum<u64>>())
            .flat_map(|sum| sum.data_points.iter())
            .filter(|point| has_test_name(&point.attributes, test_name))
            .map(|point| point.value)
            .sum()
    }

    /// Number of duration samples recorded for `test_name`, and their sum.
    pub fn histogram(&self, test_name: &str) -> (u64, f64) {
        let Some(latest) = self.latest() else {
            return (0, 0.0);
        };

        latest
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .filter(|m| m.name == TEST_DURATION_METRIC)
            .filter_map(|m| m.data.as_any().downcast_ref::<Histogram<f64>>())
            .flat_map(|hist| hist.data_points.iter())
            .filter(|point| has_test_name(&point.attributes, test_name))
            .fold((0, 0.0), |(count, sum), point| {
                (count + point.count, sum + point.sum)
            })
    }

    fn latest(&self) -> Option<ResourceMetrics> {
        self.pipeline.force_flush().expect("flush succeeds");
        self.exporter
            .get_finished_metrics()
            .expect("metrics exported")
            .pop()
    }
}

impl Default for MetricsCapture {
    fn default() -> Self {
        Self::new()
    }
}

fn has_test_name(attributes: &[KeyValue], test_name: &str) -> bool {
    attributes
        .iter()
        .any(|kv| kv.key.as_str() == TEST_NAME_LABEL && kv.value.as_str() == test_name)
}
