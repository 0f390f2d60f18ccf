//! `sshuttle` launcher: finds or clones the tool and supervises its process.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Child;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::interrupt::Interrupts;

use super::args::build_tunnel_args;
use super::{
    ExitCallback, SessionSpec, Tunnel, TunnelConfig, TunnelError, TunnelExit, TunnelSession,
};

/// Launches `sshuttle` sessions.
#[derive(Clone, Debug)]
pub struct SshuttleLauncher<R: CommandRunner> {
    config: TunnelConfig,
    runner: R,
    interrupts: Interrupts,
}

impl SshuttleLauncher<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] when validation fails.
    pub fn with_process_runner(
        config: TunnelConfig,
        interrupts: Interrupts,
    ) -> Result<Self, TunnelError> {
        Self::new(config, ProcessCommandRunner, interrupts)
    }
}

impl<R: CommandRunner> SshuttleLauncher<R> {
    /// Creates a launcher using the provided runner for `git`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] when configuration validation fails.
    pub fn new(
        config: TunnelConfig,
        runner: R,
        interrupts: Interrupts,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            interrupts,
        })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn installed(&self) -> Option<Utf8PathBuf> {
        which::which(&self.config.sshuttle_bin)
            .ok()
            .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
    }

    fn fetch(&self) -> Result<Utf8PathBuf, TunnelError> {
        let dir = self.config.resolved_clone_dir();
        if dir.exists() {
            debug!(dir = %dir, "reusing existing sshuttle checkout");
        } else {
            info!(
                repository = %self.config.repository_url,
                dir = %dir,
                "sshuttle not installed, cloning"
            );
            let args = [
                OsString::from("clone"),
                OsString::from(&self.config.repository_url),
                OsString::from(dir.as_str()),
            ];
            self.runner
                .run(&self.config.git_bin, &args)
                .and_then(|output| output.into_success(&self.config.git_bin))
                .map_err(|err| TunnelError::ToolUnavailable(err.to_string()))?;
        }

        let entrypoint = dir.join(&self.config.entrypoint);
        if entrypoint.is_file() {
            Ok(entrypoint)
        } else {
            Err(TunnelError::ToolUnavailable(format!(
                "{entrypoint} not found after fetching {}",
                self.config.repository_url
            )))
        }
    }
}

impl<R: CommandRunner> Tunnel for SshuttleLauncher<R> {
    fn resolve_executable(&self) -> Result<Utf8PathBuf, TunnelError> {
        if let Some(path) = self.installed() {
            debug!(path = %path, "using installed sshuttle");
            return Ok(path);
        }
        self.fetch()
    }

    fn start_session(
        &self,
        executable: &Utf8Path,
        spec: &SessionSpec,
        on_exit: ExitCallback,
    ) -> Result<TunnelSession, TunnelError> {
        let command_line = build_tunnel_args(executable, spec)?;
        let interrupts = self.interrupts.subscribe();

        let child = tokio::process::Command::new(executable.as_std_path())
            .args(command_line.iter().skip(1))
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                program: executable.to_string(),
                message: err.to_string(),
            })?;
        self.interrupts.forward_process_signals();
        info!(command = %command_line.join(" "), "tunnel started");

        let task = tokio::spawn(supervise(child, interrupts, on_exit));
        Ok(TunnelSession::new(command_line, task))
    }
}

async fn supervise(
    mut child: Child,
    mut interrupts: broadcast::Receiver<()>,
    on_exit: ExitCallback,
) -> TunnelExit {
    let mut listening = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            received = interrupts.recv(), if listening => match received {
                Ok(()) | Err(RecvError::Lagged(_)) => forward_interrupt(&mut child),
                Err(RecvError::Closed) => listening = false,
            },
        }
    };

    let exit = match status {
        Ok(status) => TunnelExit::from(status),
        Err(err) => {
            warn!(error = %err, "lost track of tunnel process");
            TunnelExit { code: None }
        }
    };
    info!(code = ?exit.code, "tunnel exited");
    on_exit(exit).await;
    exit
}

#[cfg(unix)]
fn forward_interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    debug!(pid, "forwarding interrupt to tunnel");
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(error = %err, "failed to interrupt tunnel");
    }
}

#[cfg(not(unix))]
fn forward_interrupt(child: &mut Child) {
    debug!("stopping tunnel after interrupt");
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to stop tunnel");
    }
}
