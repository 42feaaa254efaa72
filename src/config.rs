//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::hcloud::DEFAULT_ENDPOINT;

const APP_NAME: &str = "hcloud-csi-controller";

/// Hetzner Cloud credentials and API settings, read from `HCLOUD_*`
/// environment variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "HCLOUD")]
pub struct HcloudConfig {
    /// API token with read/write access to the project. Required.
    pub token: String,
    /// API base URL.
    #[ortho_config(default = DEFAULT_ENDPOINT.to_owned())]
    pub endpoint: String,
    /// Location used for volumes without topology requirements. Discovered
    /// from the metadata service when unset.
    pub volume_default_location: Option<String>,
    /// Base URL of the instance metadata service.
    #[ortho_config(default = "http://169.254.169.254/hetzner/v1/metadata".to_owned())]
    pub metadata_endpoint: String,
    /// Sustained outbound API requests per second.
    #[ortho_config(default = 5)]
    pub rate_limit_per_second: u32,
    /// Outbound API requests allowed in a burst.
    #[ortho_config(default = 20)]
    pub rate_limit_burst: u32,
}

/// Seconds allowed for RPCs that carry no `grpc-timeout`, unless configured.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 120;

/// Plugin endpoint and request handling settings, read from `CSI_*`
/// environment variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CSI")]
pub struct CsiConfig {
    /// Listen address, `unix:///path` or `tcp://host:port`.
    #[ortho_config(default = "unix:///run/csi/socket".to_owned())]
    pub endpoint: String,
    /// Deadline applied to RPCs that carry no `grpc-timeout`.
    #[ortho_config(default = DEFAULT_OPERATION_TIMEOUT_SECS)]
    pub operation_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, key: &'static str) -> Self {
        Self {
            description,
            env_var,
            key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to the configuration file",
            metadata.description, metadata.env_var, metadata.key
        )));
    }
    Ok(())
}

impl HcloudConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails and
    /// [`ConfigError::MissingField`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])?;
        config.validate()?;
        Ok(config)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when the rate budget cannot admit any
    /// request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.token,
            &FieldMetadata::new("Hetzner Cloud API token", "HCLOUD_TOKEN", "token"),
        )?;
        require_field(
            &self.endpoint,
            &FieldMetadata::new("Hetzner Cloud API endpoint", "HCLOUD_ENDPOINT", "endpoint"),
        )?;
        if self.rate_limit_burst == 0 {
            return Err(ConfigError::Invalid(String::from(
                "HCLOUD_RATE_LIMIT_BURST must be at least 1",
            )));
        }
        Ok(())
    }

    /// Default location with surrounding whitespace removed, if configured.
    #[must_use]
    pub fn default_location(&self) -> Option<&str> {
        self.volume_default_location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
    }
}

impl CsiConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails and
    /// [`ConfigError::MissingField`] when the endpoint is empty.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])?;
        require_field(
            &config.endpoint,
            &FieldMetadata::new("plugin endpoint", "CSI_ENDPOINT", "endpoint"),
        )?;
        Ok(config)
    }

    /// Deadline used when a request carries none.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<std::sync::Arc<ortho_config::OrthoError>> for ConfigError {
    fn from(value: std::sync::Arc<ortho_config::OrthoError>) -> Self {
        Self::Parse(value.to_string())
    }
}
