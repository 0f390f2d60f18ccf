//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::provider::{ProvisioningRequest, SshKeyId};

/// Default DigitalOcean v1 API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.digitalocean.com";

/// Command-line fragment of the server process `sshuttle` starts remotely.
pub const DEFAULT_WATCH_PATTERN: &str = "assembler.py";

/// Name of the layered configuration file.
pub const CONFIG_FILE_NAME: &str = "instavpn.toml";

/// Provider credentials, machine defaults, and lifecycle settings derived from
/// environment variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "INSTAVPN",
    discovery(
        app_name = "instavpn",
        env_var = "INSTAVPN_CONFIG_PATH",
        config_file_name = "instavpn.toml",
        dotfile_name = ".instavpn.toml",
        project_file_name = "instavpn.toml"
    )
)]
pub struct InstavpnConfig {
    /// API key sent with every provider call. This value is required.
    pub api_key: String,
    /// Client identifier sent with every provider call. This value is
    /// required.
    pub client_id: String,
    /// Base URL of the provider API.
    #[ortho_config(default = DEFAULT_API_BASE_URL.to_owned())]
    pub api_base_url: String,
    /// Region slug or identifier used when `--region` is not given.
    #[ortho_config(default = "nyc1".to_owned())]
    pub default_region: String,
    /// Size slug or identifier used when `--size` is not given.
    #[ortho_config(default = "512mb".to_owned())]
    pub default_size: String,
    /// Image slug or identifier used when `--image` is not given.
    #[ortho_config(default = "ubuntu-20-04-x64".to_owned())]
    pub default_image: String,
    /// Machine name used when `--name` is not given.
    #[ortho_config(default = "instavpn".to_owned())]
    pub default_name: String,
    /// Comma-separated SSH key identifiers installed on new machines.
    pub ssh_key_ids: Option<String>,
    /// Maximum number of status checks before giving up on activation.
    #[ortho_config(default = 30)]
    pub max_retries: u32,
    /// Seconds to wait after creation before the first status check.
    #[ortho_config(default = 20)]
    pub initial_delay_secs: u64,
    /// Seconds between consecutive status checks.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Whether to install the remote self-destruct watchdog.
    #[ortho_config(default = true)]
    pub self_destruct: bool,
    /// Seconds of tunnel absence after which the watchdog destroys the
    /// machine.
    #[ortho_config(default = 300)]
    pub self_destruct_timeout_secs: u64,
    /// Whether destroy calls scrub the machine's disk.
    #[ortho_config(default = false)]
    pub scrub: bool,
    /// Whether a failing tunnel exit destroys the machine.
    #[ortho_config(default = true)]
    pub destroy_on_exit: bool,
    /// Optional watchdog script template replacing the built-in one.
    pub self_destruct_template: Option<Utf8PathBuf>,
    /// `pgrep -f` pattern matching the remote side of the tunnel. The default
    /// matches the bootstrap `sshuttle` runs on the server.
    #[ortho_config(default = DEFAULT_WATCH_PATTERN.to_owned())]
    pub watch_pattern: String,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl InstavpnConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("instavpn")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty,
    /// or [`ConfigError::Invalid`] when the retry budget is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.api_key,
            &FieldMetadata::new("DigitalOcean API key", "INSTAVPN_API_KEY", "api_key"),
        )?;
        Self::require_field(
            &self.client_id,
            &FieldMetadata::new("DigitalOcean client ID", "INSTAVPN_CLIENT_ID", "client_id"),
        )?;
        Self::require_field(
            &self.api_base_url,
            &FieldMetadata::new("API base URL", "INSTAVPN_API_BASE_URL", "api_base_url"),
        )?;
        Self::require_field(
            &self.watch_pattern,
            &FieldMetadata::new(
                "remote tunnel process pattern",
                "INSTAVPN_WATCH_PATTERN",
                "watch_pattern",
            ),
        )?;
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(String::from(
                "max_retries must be at least 1 (INSTAVPN_MAX_RETRIES)",
            )));
        }
        Ok(())
    }

    /// SSH keys configured through `ssh_key_ids`, in declaration order.
    #[must_use]
    pub fn ssh_keys(&self) -> Vec<SshKeyId> {
        self.ssh_key_ids
            .as_deref()
            .map(SshKeyId::parse_list)
            .unwrap_or_default()
    }

    /// Starts a request builder seeded with the configured machine defaults.
    #[must_use]
    pub fn request_builder(&self) -> crate::provider::ProvisioningRequestBuilder {
        ProvisioningRequest::builder()
            .region(&self.default_region)
            .size(&self.default_size)
            .image(&self.default_image)
            .name(&self.default_name)
            .ssh_key_ids(self.ssh_keys())
    }

    /// Delay before the first status check.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Delay between status checks.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
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
