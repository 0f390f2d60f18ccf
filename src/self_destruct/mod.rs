//! Remote watchdog that destroys the machine once the tunnel is gone.
//!
//! The watchdog is a shell script rendered from a template and started on the
//! machine in the background, so installing it never blocks the tunnel.

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::Url;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};

/// Remote log file the watchdog appends to.
pub const DEFAULT_LOG_FILE: &str = "instavpn-self-destruct.log";
/// Seconds `ssh` waits for the machine to accept a connection.
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 15;

const BUILTIN_TEMPLATE: &str = include_str!("watchdog.sh");
const DESTROY_URL: &str = "{{destroy_url}}";

/// Watchdog script template with `{{watch_pattern}}`, `{{timeout}}`,
/// `{{destroy_url}}` and `{{log_file}}` placeholders.
///
/// `{{watch_pattern}}` renders as a `printf` argument made of octal escapes,
/// so the pattern never appears verbatim in the watchdog's own command line
/// and `pgrep -f` cannot match the watchdog itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchdogScript {
    template: String,
}

impl WatchdogScript {
    /// The bundled watchdog.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            template: BUILTIN_TEMPLATE.to_owned(),
        }
    }

    /// Uses `template` verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`SelfDestructError::Template`] when the template never
    /// references `{{destroy_url}}`.
    pub fn from_template(template: impl Into<String>) -> Result<Self, SelfDestructError> {
        let template = template.into();
        if !template.contains(DESTROY_URL) {
            return Err(SelfDestructError::Template(format!(
                "template must reference {DESTROY_URL}"
            )));
        }
        Ok(Self { template })
    }

    /// Reads a template from disk.
    ///
    /// # Errors
    ///
    /// Returns [`SelfDestructError::Template`] when the file cannot be read or
    /// lacks the `{{destroy_url}}` placeholder.
    pub fn from_file(path: &Utf8Path) -> Result<Self, SelfDestructError> {
        let template = std::fs::read_to_string(path)
            .map_err(|err| SelfDestructError::Template(format!("{path}: {err}")))?;
        Self::from_template(template)
    }

    /// Substitutes every placeholder with a shell-escaped value.
    #[must_use]
    pub fn render(
        &self,
        watch_pattern: &str,
        timeout: Duration,
        destroy_url: &Url,
        log_file: &str,
    ) -> String {
        self.template
            .replace("{{watch_pattern}}", &octal_escaped(watch_pattern))
            .replace("{{timeout}}", &timeout.as_secs().to_string())
            .replace(DESTROY_URL, &escape(destroy_url.as_str().into()))
            .replace("{{log_file}}", &escape(log_file.into()))
    }
}

/// Single-quoted `printf` format reproducing `value` byte for byte.
fn octal_escaped(value: &str) -> String {
    let octal: String = value.bytes().map(|byte| format!("\\{byte:03o}")).collect();
    format!("'{octal}'")
}

/// Machine the watchdog is installed on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Login user.
    pub user: String,
    /// Public address.
    pub host: IpAddr,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Runs scripts on a remote machine without waiting for them.
pub trait RemoteExecutor {
    /// Starts `script` in the background on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SelfDestructError::Remote`] when the script cannot be
    /// started.
    fn run_detached(&self, target: &RemoteTarget, script: &str) -> Result<(), SelfDestructError>;
}

/// [`RemoteExecutor`] backed by the local `ssh` client.
#[derive(Clone, Debug)]
pub struct SshRemoteExecutor<R: CommandRunner> {
    ssh_bin: String,
    runner: R,
}

impl SshRemoteExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(ssh_bin: impl Into<String>) -> Self {
        Self::new(ssh_bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshRemoteExecutor<R> {
    /// Creates an executor that invokes `ssh_bin` through `runner`.
    #[must_use]
    pub fn new(ssh_bin: impl Into<String>, runner: R) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            runner,
        }
    }

    fn build_args(target: &RemoteTarget, script: &str) -> Vec<OsString> {
        let remote_command = format!(
            "nohup bash -c {} > /dev/null 2>&1 &",
            escape(script.into())
        );
        vec![
            OsString::from("-n"),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}")),
            OsString::from(target.to_string()),
            OsString::from(remote_command),
        ]
    }
}

impl<R: CommandRunner> RemoteExecutor for SshRemoteExecutor<R> {
    fn run_detached(&self, target: &RemoteTarget, script: &str) -> Result<(), SelfDestructError> {
        let args = Self::build_args(target, script);
        self.runner
            .run(&self.ssh_bin, &args)?
            .into_success(&self.ssh_bin)?;
        Ok(())
    }
}

/// Installs the watchdog on freshly connected machines.
#[derive(Clone, Debug)]
pub struct SelfDestruct<X> {
    executor: X,
    script: WatchdogScript,
    watch_pattern: String,
    log_file: String,
}

impl<X: RemoteExecutor> SelfDestruct<X> {
    /// Creates an installer whose watchdog treats any process whose command
    /// line matches `watch_pattern` (a `pgrep -f` pattern) as the live tunnel.
    #[must_use]
    pub fn new(executor: X, script: WatchdogScript, watch_pattern: impl Into<String>) -> Self {
        Self {
            executor,
            script,
            watch_pattern: watch_pattern.into(),
            log_file: DEFAULT_LOG_FILE.to_owned(),
        }
    }

    /// Overrides the remote log file.
    #[must_use]
    pub fn with_log_file(mut self, log_file: impl Into<String>) -> Self {
        self.log_file = log_file.into();
        self
    }

    /// Returns the executor, mainly for inspection in tests.
    #[must_use]
    pub const fn executor(&self) -> &X {
        &self.executor
    }

    /// Renders the watchdog and starts it on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SelfDestructError::Remote`] when the executor fails.
    pub fn install(
        &self,
        target: &RemoteTarget,
        destroy_url: &Url,
        timeout: Duration,
    ) -> Result<(), SelfDestructError> {
        let script = self
            .script
            .render(&self.watch_pattern, timeout, destroy_url, &self.log_file);
        self.executor.run_detached(target, &script)?;
        info!(
            target = %target,
            timeout_secs = timeout.as_secs(),
            "self-destruct watchdog installed"
        );
        Ok(())
    }
}

/// Errors raised while preparing or installing the watchdog.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SelfDestructError {
    /// Raised when a custom template is unusable.
    #[error("invalid self-destruct template: {0}")]
    Template(String),
    /// Raised when the remote command cannot be started.
    #[error("failed to start self-destruct watchdog: {0}")]
    Remote(#[from] CommandError),
    /// Raised when the blocking install task panics or is cancelled.
    #[error("self-destruct install task failed: {0}")]
    Join(String),
}
