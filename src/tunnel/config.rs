//! Tunnel tool configuration loaded via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{CONFIG_FILE_NAME, ConfigError};

/// Directory the tunnel tool is cloned into when it is not installed.
pub const DEFAULT_CLONE_DIR: &str = "sshuttle";

/// Settings for locating and invoking the tunnel tool.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "INSTAVPN_TUNNEL",
    discovery(
        app_name = "instavpn",
        env_var = "INSTAVPN_CONFIG_PATH",
        config_file_name = "instavpn.toml",
        dotfile_name = ".instavpn.toml",
        project_file_name = "instavpn.toml"
    )
)]
pub struct TunnelConfig {
    /// Name or path of the `sshuttle` executable looked up on `PATH`.
    #[ortho_config(default = "sshuttle".to_owned())]
    pub sshuttle_bin: String,
    /// Repository cloned when `sshuttle` is not installed.
    #[ortho_config(default = "https://github.com/sshuttle/sshuttle".to_owned())]
    pub repository_url: String,
    /// Clone destination; defaults to `./sshuttle` under the working
    /// directory.
    pub clone_dir: Option<Utf8PathBuf>,
    /// Script inside the clone that launches the tool.
    #[ortho_config(default = "run".to_owned())]
    pub entrypoint: String,
    /// Path to the `git` executable.
    #[ortho_config(default = "git".to_owned())]
    pub git_bin: String,
    /// Subnet routed through the tunnel when `--subnet` is not given.
    #[ortho_config(default = "0/0".to_owned())]
    pub subnet: String,
    /// Whether DNS is proxied when `--dns` is not given.
    #[ortho_config(default = false)]
    pub proxy_dns: bool,
    /// Extra tunnel arguments, tokenised like a shell would.
    #[ortho_config(default = String::new())]
    pub extra_args: String,
    /// Remote user the tunnel and watchdog log in as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
}

impl TunnelConfig {
    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// to set when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("sshuttle_bin", &self.sshuttle_bin),
            ("repository_url", &self.repository_url),
            ("entrypoint", &self.entrypoint),
            ("git_bin", &self.git_bin),
            ("ssh_user", &self.ssh_user),
            ("ssh_bin", &self.ssh_bin),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "missing {field}: set INSTAVPN_TUNNEL_{} or add {field} to {CONFIG_FILE_NAME}",
                    field.to_uppercase()
                )));
            }
        }
        Ok(())
    }

    /// Loads configuration using defaults, configuration files, and
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("instavpn")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Clone destination, resolved against the working directory when no
    /// override is configured.
    #[must_use]
    pub fn resolved_clone_dir(&self) -> Utf8PathBuf {
        if let Some(dir) = &self.clone_dir {
            return dir.clone();
        }
        std::env::current_dir()
            .ok()
            .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
            .map_or_else(
                || Utf8PathBuf::from(DEFAULT_CLONE_DIR),
                |cwd| cwd.join(DEFAULT_CLONE_DIR),
            )
    }
}
