//! Telemetry configuration.
//!
//! Loaded from the standard `OTEL_*` environment variables. Header values are
//! redacted in Debug output since they usually carry credentials.

use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default `service.name` resource attribute.
pub const DEFAULT_SERVICE_NAME: &str = "e2e-tests";

/// Default `service.version` resource attribute.
pub const DEFAULT_SERVICE_VERSION: &str = "0.1.0";

/// Wire format used to push metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportProtocol {
    #[default]
    Grpc,
    HttpProtobuf,
}

impl ExportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportProtocol::Grpc => "grpc",
            ExportProtocol::HttpProtobuf => "http/protobuf",
        }
    }
}

impl fmt::Display for ExportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics pipeline configuration.
#[derive(Clone)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute (default: "e2e-tests").
    pub service_name: String,

    /// `service.version` resource attribute (default: "0.1.0").
    pub service_version: String,

    /// OTLP collector endpoint. `None` keeps metrics in-process.
    pub endpoint: Option<String>,

    /// Export wire format (default: gRPC).
    pub protocol: ExportProtocol,

    /// Use plaintext transport to the collector. When false every export goes over
    /// TLS; an explicit endpoint scheme must agree with this setting.
    pub insecure: bool,

    /// Extra headers (HTTP) or metadata (gRPC) sent with every export.
    pub headers: HashMap<String, String>,
}

impl fmt::Debug for TelemetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&String> = self.headers.keys().collect();
        f.debug_struct("TelemetryConfig")
            .field("service_name", &self.service_name)
            .field("service_version", &self.service_version)
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol)
            .field("insecure", &self.insecure)
            .field("headers", &header_names)
            .finish()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            endpoint: None,
            protocol: ExportProtocol::default(),
            insecure: false,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid OTLP protocol: {0}")]
    InvalidProtocol(String),

    #[error("Invalid boolean for {name}: {value}")]
    InvalidBool { name: String, value: String },

    #[error("Invalid OTLP headers: {0}")]
    InvalidHeaders(String),

    #[error("Invalid OTLP endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TelemetryConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let service_name = non_empty(vars, "OTEL_SERVICE_NAME")
            .unwrap_or(DEFAULT_SERVICE_NAME)
            .to_string();

        let service_version = non_empty(vars, "OTEL_SERVICE_VERSION")
            .unwrap_or(DEFAULT_SERVICE_VERSION)
            .to_string();

        let endpoint = non_empty(vars, "OTEL_EXPORTER_OTLP_ENDPOINT").map(str::to_string);

        let protocol = match non_empty(vars, "OTEL_EXPORTER_OTLP_PROTOCOL") {
            None | Some("grpc") => ExportProtocol::Grpc,
            Some("http/protobuf") => ExportProtocol::HttpProtobuf,
            Some(other) => {
                return Err(ConfigError::InvalidProtocol(format!(
                    "OTEL_EXPORTER_OTLP_PROTOCOL must be 'grpc' or 'http/protobuf', got '{}'",
                    other
                )))
            }
        };

        let insecure = parse_bool(vars, "OTEL_EXPORTER_OTLP_INSECURE")?.unwrap_or(false);
        if let Some(endpoint) = &endpoint {
            check_endpoint_scheme(endpoint, insecure)?;
        }

        let headers = match non_empty(vars, "OTEL_EXPORTER_OTLP_HEADERS") {
            Some(raw) => parse_headers(raw)?,
            None => HashMap::new(),
        };

        Ok(TelemetryConfig {
            service_name,
            service_version,
            endpoint,
            protocol,
            insecure,
            headers,
        })
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// An endpoint may omit its scheme; if present it has to match the transport security.
fn check_endpoint_scheme(endpoint: &str, insecure: bool) -> Result<(), ConfigError> {
    let Some((scheme, _)) = endpoint.split_once("://") else {
        return Ok(());
    };
    match (scheme.to_ascii_lowercase().as_str(), insecure) {
        ("https", false) | ("http", true) => Ok(()),
        ("http", false) => Err(ConfigError::InvalidEndpoint(format!(
            "'{endpoint}' is plaintext but OTEL_EXPORTER_OTLP_INSECURE is not 'true'"
        ))),
        ("https", true) => Err(ConfigError::InvalidEndpoint(format!(
            "'{endpoint}' uses TLS but OTEL_EXPORTER_OTLP_INSECURE is 'true'"
        ))),
        (other, _) => Err(ConfigError::InvalidEndpoint(format!(
            "unsupported scheme '{other}' in '{endpoint}'"
        ))),
    }
}

/// Parse an optional `true`/`false` variable.
pub fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<Option<bool>, ConfigError> {
    match non_empty(vars, name) {
        None => Ok(None),
        Some(value) if value.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(value) if value.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(value) => Err(ConfigError::InvalidBool {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse `key1=value1,key2=value2`.
fn parse_headers(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ConfigError::InvalidHeaders(format!("expected key=value, got '{}'", pair))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidHeaders(
                    "header name must not be empty".to_string(),
                ));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = TelemetryConfig::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.service_version, DEFAULT_SERVICE_VERSION);
        assert_eq!(config.endpoint, None);
        assert_eq!(config.protocol, ExportProtocol::Grpc);
        assert!(!config.insecure);
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_from_vars_custom_values() {
        let config = TelemetryConfig::from_vars(&vars(&[
            ("OTEL_SERVICE_NAME", "cluster-checks"),
            ("OTEL_SERVICE_VERSION", "1.2.3"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/protobuf"),
            ("OTEL_EXPORTER_OTLP_INSECURE", "true"),
            ("OTEL_EXPORTER_OTLP_HEADERS", "x-tenant=ops, authorization=Bearer abc"),
        ]))
        .expect("config should load");

        assert_eq!(config.service_name, "cluster-checks");
        assert_eq!(config.service_version, "1.2.3");
        assert_eq!(config.endpoint.as_deref(), Some("http://collector:4318"));
        assert_eq!(config.protocol, ExportProtocol::HttpProtobuf);
        assert!(config.insecure);
        assert_eq!(config.headers.get("x-tenant").map(String::as_str), Some("ops"));
        assert_eq!(
            config.headers.get("authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[test]
    fn test_empty_endpoint_means_absent() {
        let config = TelemetryConfig::from_vars(&vars(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "")]))
            .expect("config should load");
        assert_eq!(config.endpoint, None);
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let result =
            TelemetryConfig::from_vars(&vars(&[("OTEL_EXPORTER_OTLP_PROTOCOL", "http/json")]));
        assert!(
            matches!(result, Err(ConfigError::InvalidProtocol(msg)) if msg.contains("http/json"))
        );
    }

    #[test]
    fn test_rejects_non_boolean_insecure() {
        let result = TelemetryConfig::from_vars(&vars(&[("OTEL_EXPORTER_OTLP_INSECURE", "yes")]));
        assert!(matches!(result, Err(ConfigError::InvalidBool { name, .. }) if name == "OTEL_EXPORTER_OTLP_INSECURE"));
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let result =
            TelemetryConfig::from_vars(&vars(&[("OTEL_EXPORTER_OTLP_HEADERS", "x-tenant")]));
        assert!(matches!(result, Err(ConfigError::InvalidHeaders(_))));

        let result = TelemetryConfig::from_vars(&vars(&[("OTEL_EXPORTER_OTLP_HEADERS", "=ops")]));
        assert!(matches!(result, Err(ConfigError::InvalidHeaders(_))));
    }

    #[test]
    fn test_debug_redacts_header_values() {
        let config = TelemetryConfig::from_vars(&vars(&[(
            "OTEL_EXPORTER_OTLP_HEADERS",
            "authorization=Bearer secret-token",
        )]))
        .expect("config should load");

        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("authorization"));
        assert!(!debug_output.contains("secret-token"));
    }

    #[test]
    fn test_endpoint_scheme_must_match_transport_security() {
        let load = |endpoint: &str, insecure: &str| {
            TelemetryConfig::from_vars(&vars(&[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", endpoint),
                ("OTEL_EXPORTER_OTLP_INSECURE", insecure),
            ]))
        };

        assert!(load("collector:4317", "false").is_ok());
        assert!(load("collector:4317", "true").is_ok());
        assert!(load("https://collector:4317", "false").is_ok());
        assert!(load("http://collector:4317", "true").is_ok());

        assert!(matches!(
            load("http://collector:4317", "false"),
            Err(ConfigError::InvalidEndpoint(msg)) if msg.contains("plaintext")
        ));
        assert!(matches!(
            load("https://collector:4317", "true"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            load("unix:///var/run/otel.sock", "false"),
            Err(ConfigError::InvalidEndpoint(msg)) if msg.contains("unix")
        ));
    }
}
