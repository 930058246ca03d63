//! Observability for test runs.
//!
//! Test outcomes are exported as OpenTelemetry metrics. The pipeline is an explicit
//! object created at process start and shut down at process end; the collector holds
//! instruments created from it.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `test_executed_total` | Counter | `test_name` | Tests executed |
//! | `test_errors_total` | Counter | `test_name` | Tests that failed |
//! | `test_duration_seconds` | Histogram | `test_name` | Wall-clock test duration |

pub mod collector;
pub mod pipeline;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collector::MetricsCollector;
pub use pipeline::{MetricsPipeline, TelemetryError};
