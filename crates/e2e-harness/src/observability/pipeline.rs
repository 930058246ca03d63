//! OpenTelemetry metrics pipeline with optional OTLP push export.

use crate::config::{ExportProtocol, TelemetryConfig};
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::reader::MetricReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::{runtime, Resource};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{info, warn};

/// Meter name used for every instrument.
pub const METER_NAME: &str = "e2e-tests";

/// Periodic push interval when an endpoint is configured.
pub const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Per-export request timeout.
pub const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for flushing and releasing the exporter on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Path appended to HTTP endpoints given without one.
const HTTP_METRICS_PATH: &str = "/v1/metrics";

/// Metrics pipeline errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to create OTLP exporter: {0}")]
    ExporterInit(String),

    #[error("Invalid OTLP header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Failed to shut down meter provider: {0}")]
    Shutdown(String),

    #[error("Meter provider shutdown did not finish within {0:?}")]
    ShutdownTimedOut(Duration),
}

/// Process-wide metrics pipeline.
///
/// Without an endpoint, instruments still record into the in-process provider
/// but nothing is ever transmitted.
pub struct MetricsPipeline {
    provider: SdkMeterProvider,
    exporting: bool,
}

impl MetricsPipeline {
    /// Build the pipeline described by `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the OTLP exporter cannot be constructed.
    pub fn setup(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let resource = resource(config);

        let Some(endpoint) = config.endpoint.as_deref() else {
            info!("No OTLP endpoint configured, metrics will be collected but not exported");
            let provider = SdkMeterProvider::builder().with_resource(resource).build();
            return Ok(Self {
                provider,
                exporting: false,
            });
        };

        let provider = match config.protocol {
            ExportProtocol::Grpc => {
                let channel = grpc_channel(&grpc_url(endpoint, config.insecure), config.insecure)?;
                let exporter = opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_channel(channel)
                    .with_timeout(EXPORT_TIMEOUT)
                    .with_metadata(grpc_metadata(config)?);
                opentelemetry_otlp::new_pipeline()
                    .metrics(runtime::Tokio)
                    .with_exporter(exporter)
                    .with_resource(resource)
                    .with_period(EXPORT_INTERVAL)
                    .build()
            }
            ExportProtocol::HttpProtobuf => {
                let exporter = opentelemetry_otlp::new_exporter()
                    .http()
                    .with_http_client(http_client(config.insecure)?)
                    .with_endpoint(http_url(endpoint, config.insecure))
                    .with_timeout(EXPORT_TIMEOUT)
                    .with_headers(config.headers.clone());
                opentelemetry_otlp::new_pipeline()
                    .metrics(runtime::Tokio)
                    .with_exporter(exporter)
                    .with_resource(resource)
                    .with_period(EXPORT_INTERVAL)
                    .build()
            }
        }
        .map_err(|e| TelemetryError::ExporterInit(e.to_string()))?;

        info!(
            endpoint = %endpoint,
            protocol = %config.protocol,
            insecure = config.insecure,
            "Metrics pipeline initialized"
        );

        Ok(Self {
            provider,
            exporting: true,
        })
    }

    /// Build a local pipeline that also feeds `reader`, for in-process inspection.
    pub fn with_reader<R>(config: &TelemetryConfig, reader: R) -> Self
    where
        R: MetricReader,
    {
        let provider = SdkMeterProvider::builder()
            .with_resource(resource(config))
            .with_reader(reader)
            .build();
        Self {
            provider,
            exporting: false,
        }
    }

    /// Whether metrics are pushed to a remote collector.
    pub fn is_exporting(&self) -> bool {
        self.exporting
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter(METER_NAME)
    }

    /// Push everything recorded so far to the readers.
    pub fn force_flush(&self) -> Result<(), TelemetryError> {
        self.provider
            .force_flush()
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))
    }

    /// Flush pending data and release the exporter.
    ///
    /// Gives up after [`SHUTDOWN_TIMEOUT`] instead of blocking the caller.
    pub async fn shutdown(self) -> Result<(), TelemetryError> {
        self.shutdown_within(SHUTDOWN_TIMEOUT).await
    }

    /// Like [`shutdown`](Self::shutdown) with a custom grace period.
    ///
    /// The provider is shut down on a detached thread, so a stalled exporter is left
    /// behind on timeout and never delays runtime teardown or process exit.
    pub async fn shutdown_within(self, grace: Duration) -> Result<(), TelemetryError> {
        info!("Shutting down metrics pipeline...");
        let provider = self.provider;
        let (done_tx, done_rx) = oneshot::channel();

        thread::Builder::new()
            .name("metrics-shutdown".to_string())
            .spawn(move || {
                let _ = done_tx.send(provider.shutdown());
            })
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))?;

        match tokio::time::timeout(grace, done_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Metrics pipeline shutdown complete");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(TelemetryError::Shutdown(e.to_string())),
            Ok(Err(_)) => Err(TelemetryError::Shutdown(
                "shutdown thread exited without reporting".to_string(),
            )),
            Err(_) => {
                warn!(grace = ?grace, "Metrics pipeline shutdown timed out");
                Err(TelemetryError::ShutdownTimedOut(grace))
            }
        }
    }
}

fn resource(config: &TelemetryConfig) -> Resource {
    Resource::new([
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
    ])
}

/// Prefix `endpoint` with the scheme implied by `insecure` unless it carries one.
///
/// Configuration loading rejects explicit schemes that disagree with `insecure`.
fn with_scheme(endpoint: &str, insecure: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

fn grpc_url(endpoint: &str, insecure: bool) -> String {
    with_scheme(endpoint, insecure)
}

/// HTTP endpoints without a path get the standard metrics path.
fn http_url(endpoint: &str, insecure: bool) -> String {
    let url = with_scheme(endpoint, insecure);
    let has_path = url
        .split_once("://")
        .is_some_and(|(_, rest)| rest.trim_end_matches('/').contains('/'));
    if has_path {
        url
    } else {
        format!("{}{HTTP_METRICS_PATH}", url.trim_end_matches('/'))
    }
}

/// Lazily connecting channel; TLS unless `insecure`.
fn grpc_channel(url: &str, insecure: bool) -> Result<Channel, TelemetryError> {
    let endpoint = Endpoint::from_shared(url.to_string())
        .map_err(|e| TelemetryError::ExporterInit(format!("invalid endpoint '{url}': {e}")))?
        .timeout(EXPORT_TIMEOUT);

    let endpoint = if insecure {
        endpoint
    } else {
        let platform_and_bundled = ClientTlsConfig::new()
            .with_native_roots()
            .with_webpki_roots();
        match endpoint.clone().tls_config(platform_and_bundled) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Platform trust store unavailable, using bundled roots only");
                endpoint
                    .tls_config(ClientTlsConfig::new().with_webpki_roots())
                    .map_err(|e| TelemetryError::ExporterInit(format!("TLS setup failed: {e}")))?
            }
        }
    };

    Ok(endpoint.connect_lazy())
}

/// HTTP client for the exporter. Refuses plaintext requests unless `insecure`.
fn http_client(insecure: bool) -> Result<reqwest::Client, TelemetryError> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .https_only(!insecure)
        .timeout(EXPORT_TIMEOUT)
        .build()
        .map_err(|e| TelemetryError::ExporterInit(format!("HTTP client setup failed: {e}")))
}

fn grpc_metadata(config: &TelemetryConfig) -> Result<MetadataMap, TelemetryError> {
    let mut metadata = MetadataMap::with_capacity(config.headers.len());
    for (name, value) in &config.headers {
        let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(
            |e| TelemetryError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            },
        )?;
        let value = AsciiMetadataValue::try_from(value.as_str()).map_err(|e| {
            TelemetryError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}
