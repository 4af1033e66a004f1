//! Configuration module for Presign Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static::lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        match std::env::var(var_name) {
            Ok(val) => result.push_str(&val),
            Err(_) => match cap.get(2) {
                Some(default) => result.push_str(default.as_str()),
                // No env var and no default. Keep the original placeholder.
                None => result.push_str(full_match.as_str()),
            },
        }

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        ConfigLoader::parse(content)
    }

    /// Configuration pointing at a broker, everything else defaulted
    pub fn for_endpoint(endpoint: &str) -> Self {
        Self {
            broker: BrokerConfig {
                endpoint: endpoint.to_string(),
                timeout_seconds: default_timeout_seconds(),
            },
            upload: UploadConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.broker.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid broker endpoint '{}': must start with http:// or https://",
                self.broker.endpoint
            )));
        }

        if self.broker.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "Broker timeout_seconds must be greater than 0".into(),
            ));
        }

        if self.upload.part_size == 0 {
            return Err(ConfigError::ValidationError(
                "Upload part_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL; the broker API lives under `<endpoint>/objstorage/`
    pub endpoint: String,
    /// Per-request timeout in seconds, part transfers included. Default: 300
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    300
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Desired part size; raised per upload to the S3 limits. Default: 16MiB
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Extra attempts per part beyond the first. Default: 3
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    /// Backoff base delay in milliseconds. Default: 500
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound of the uniform backoff jitter in milliseconds. Default: 250
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            num_retries: default_num_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

fn default_part_size() -> u64 {
    16777216 // 16MiB
}

fn default_num_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_jitter_ms() -> u64 {
    250
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, 16 * 1024 * 1024);
        assert_eq!(config.num_retries, 3);
        assert_eq!(config.retry_base_delay_ms, 500);
        assert_eq!(config.retry_jitter_ms, 250);
    }

    #[test]
    fn test_config_validation_bad_endpoint() {
        let config = Config::for_endpoint("ftp://broker");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_part_size() {
        let mut config = Config::for_endpoint("http://broker");
        config.upload.part_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_ok() {
        assert!(Config::for_endpoint("https://broker.example.com").validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("PRESIGN_TEST_MISSING");
        assert_eq!(
            expand_env_vars("url: ${PRESIGN_TEST_MISSING:-http://fallback}"),
            "url: http://fallback"
        );
        assert_eq!(
            expand_env_vars("url: ${PRESIGN_TEST_MISSING}"),
            "url: ${PRESIGN_TEST_MISSING}"
        );
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_set() {
        std::env::set_var("PRESIGN_TEST_HOST", "broker.internal");
        assert_eq!(
            expand_env_vars("http://${PRESIGN_TEST_HOST:-localhost}:8080"),
            "http://broker.internal:8080"
        );
        std::env::remove_var("PRESIGN_TEST_HOST");
    }
}
