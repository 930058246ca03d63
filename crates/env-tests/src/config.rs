//! Suite configuration.

use e2e_harness::config::parse_bool;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default prefix of the ambient namespace name.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "e2e-ns";

/// Longest prefix that still leaves room for the random suffix in a 63-character name.
const MAX_NAMESPACE_PREFIX_LEN: usize = 57;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid namespace prefix: {0}")]
    InvalidNamespacePrefix(String),

    #[error("Invalid run timeout: {0}")]
    InvalidTimeout(String),

    #[error(transparent)]
    Invalid(#[from] e2e_harness::config::ConfigError),
}

/// Suite runner configuration.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Explicit kubeconfig path. `None` uses in-cluster config or the default kubeconfig.
    pub kubeconfig: Option<PathBuf>,

    /// Prefix of the ambient namespace (default: "e2e-ns").
    pub namespace_prefix: String,

    /// Cancel the run once this much time has passed.
    pub run_timeout: Option<Duration>,

    /// Run tests concurrently (default: false).
    pub parallel: bool,
}

impl SuiteConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let kubeconfig = vars
            .get("KUBECONFIG")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let namespace_prefix = match vars.get("E2E_NAMESPACE_PREFIX").map(|v| v.trim()) {
            None | Some("") => DEFAULT_NAMESPACE_PREFIX.to_string(),
            Some(prefix) => validate_prefix(prefix)?,
        };

        let run_timeout = match vars.get("E2E_RUN_TIMEOUT_SECONDS").map(|v| v.trim()) {
            None | Some("") => None,
            Some(raw) => {
                let seconds: u64 = raw.parse().map_err(|e| {
                    ConfigError::InvalidTimeout(format!(
                        "E2E_RUN_TIMEOUT_SECONDS must be a whole number of seconds, got '{}': {}",
                        raw, e
                    ))
                })?;
                if seconds == 0 {
                    return Err(ConfigError::InvalidTimeout(
                        "E2E_RUN_TIMEOUT_SECONDS must be greater than zero".to_string(),
                    ));
                }
                Some(Duration::from_secs(seconds))
            }
        };

        let parallel = parse_bool(vars, "E2E_PARALLEL")?.unwrap_or(false);

        Ok(SuiteConfig {
            kubeconfig,
            namespace_prefix,
            run_timeout,
            parallel,
        })
    }
}

/// Namespace names are DNS labels: lowercase alphanumerics and '-', starting with a letter.
fn validate_prefix(prefix: &str) -> Result<String, ConfigError> {
    let valid_chars = prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_with_letter = prefix.chars().next().is_some_and(|c| c.is_ascii_lowercase());

    if !valid_chars || !starts_with_letter {
        return Err(ConfigError::InvalidNamespacePrefix(format!(
            "'{}' must start with a lowercase letter and contain only [a-z0-9-]",
            prefix
        )));
    }
    if prefix.len() > MAX_NAMESPACE_PREFIX_LEN {
        return Err(ConfigError::InvalidNamespacePrefix(format!(
            "'{}' is longer than {} characters",
            prefix, MAX_NAMESPACE_PREFIX_LEN
        )));
    }
    Ok(prefix.to_string())
}
