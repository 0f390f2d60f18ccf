//! Tunnel tool launching and supervision.
//!
//! A [`Tunnel`] locates the tool, then starts it on a background task that
//! owns the child process. The task forwards interrupts to the child and runs
//! the exit callback exactly once before completing, so awaiting
//! [`TunnelSession::wait`] also awaits any teardown the callback performs.

mod args;
mod config;
mod error;
mod sshuttle;


use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::task::JoinHandle;

pub use config::{DEFAULT_CLONE_DIR, TunnelConfig};
pub use error::TunnelError;
pub use sshuttle::SshuttleLauncher;

/// Parameters for a single tunnel session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSpec {
    /// Remote endpoint in `user@host` form.
    pub remote: String,
    /// Subnet routed through the tunnel (for example `0/0`).
    pub subnet: String,
    /// Whether DNS queries are proxied as well.
    pub proxy_dns: bool,
    /// Extra arguments, tokenised like a shell would.
    pub extra_args: String,
}

/// How the tunnel process ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TunnelExit {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
}

impl TunnelExit {
    /// Returns `true` for anything other than a clean zero exit.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self.code, Some(0))
    }

    /// Exit code to propagate from this process; `1` for signal deaths.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        self.code.unwrap_or(1)
    }
}

impl From<std::process::ExitStatus> for TunnelExit {
    fn from(value: std::process::ExitStatus) -> Self {
        Self { code: value.code() }
    }
}

/// Future produced by an exit callback.
pub type ExitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked once with the tunnel's exit status.
pub type ExitCallback = Box<dyn FnOnce(TunnelExit) -> ExitFuture + Send>;

/// Handle to a running tunnel.
#[derive(Debug)]
pub struct TunnelSession {
    command_line: Vec<String>,
    task: JoinHandle<TunnelExit>,
}

impl TunnelSession {
    /// Wraps a supervising task and the command line it launched.
    #[must_use]
    pub const fn new(command_line: Vec<String>, task: JoinHandle<TunnelExit>) -> Self {
        Self { command_line, task }
    }

    /// Argument vector used to start the process, executable first.
    #[must_use]
    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    /// Waits for the process to exit and its exit callback to finish.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Join`] when the supervising task panicked or was
    /// cancelled.
    pub async fn wait(self) -> Result<TunnelExit, TunnelError> {
        self.task
            .await
            .map_err(|err| TunnelError::Join(err.to_string()))
    }
}

/// Launches tunnel sessions.
pub trait Tunnel {
    /// Finds the tunnel executable, fetching it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ToolUnavailable`] when the tool is absent and
    /// cannot be fetched.
    fn resolve_executable(&self) -> Result<Utf8PathBuf, TunnelError>;

    /// Starts a session without waiting for it to finish. `on_exit` runs on
    /// the session's task once the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidArguments`] when the argument vector
    /// cannot be built, or [`TunnelError::Spawn`] when the process does not
    /// start.
    fn start_session(
        &self,
        executable: &Utf8Path,
        spec: &SessionSpec,
        on_exit: ExitCallback,
    ) -> Result<TunnelSession, TunnelError>;
}

/// Builds the argument vector for `spec`, executable first.
///
/// # Errors
///
/// Returns [`TunnelError::InvalidArguments`] when the remote or subnet is
/// blank, or the extra arguments have unbalanced quotes.
pub fn tunnel_command_line(
    executable: &Utf8Path,
    spec: &SessionSpec,
) -> Result<Vec<String>, TunnelError> {
    args::build_tunnel_args(executable, spec)
}
