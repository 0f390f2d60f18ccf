//! Orchestrates a single VPN session end to end.
//!
//! The workflow creates a machine through a [`Provider`], polls it until it is
//! active, starts a tunnel to it, and optionally installs the remote
//! self-destruct watchdog. When the tunnel exits with a failure the exit
//! callback destroys the machine on the tunnel's own task, so awaiting the
//! session also awaits teardown.

#[cfg(test)]
mod tests;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::task::spawn_blocking;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::provider::{
    MachineDescriptor, MachineId, MachineStatus, Provider, ProvisioningRequest, SshKeyId,
};
use crate::self_destruct::{RemoteExecutor, RemoteTarget, SelfDestruct, SelfDestructError};
use crate::tunnel::{
    ExitCallback, ExitFuture, SessionSpec, Tunnel, TunnelError, TunnelExit, TunnelSession,
};

/// Default number of status checks before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 30;
/// Default wait between creation and the first status check.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(20);
/// Default wait between status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SSH_USER: &str = "root";

/// What happens to the machine when things end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DestructionPolicy {
    /// Destroy the machine when the tunnel exits with a failure.
    pub destroy_on_exit: bool,
    /// Scrub the disk on destroy.
    pub scrub: bool,
    /// Inactivity timeout for the remote watchdog; `None` disables it.
    pub self_destruct_timeout: Option<Duration>,
}

impl Default for DestructionPolicy {
    fn default() -> Self {
        Self {
            destroy_on_exit: true,
            scrub: false,
            self_destruct_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Where the machine comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MachineSource {
    /// Create a new machine.
    Create(ProvisioningRequest),
    /// Reuse a machine described by a previously printed state.
    Existing(MachineDescriptor),
}

/// Workflow states, logged on every transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowState {
    /// The create call is in flight.
    Requesting,
    /// Waiting for the machine to become active.
    Polling,
    /// The machine is active.
    Active,
    /// The tunnel is being started.
    Connecting,
    /// The tunnel process is running.
    Connected,
    /// The machine is being destroyed after a failed tunnel exit.
    TearingDown,
    /// Nothing left to do.
    Done,
    /// The workflow stopped with an error.
    Failed,
}

impl WorkflowState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Requesting => "requesting",
            Self::Polling => "polling",
            Self::Active => "active",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::TearingDown => "tearing-down",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine that reported `active`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActiveMachine {
    descriptor: MachineDescriptor,
    retries: u32,
}

impl ActiveMachine {
    /// Latest descriptor reported by the provider.
    #[must_use]
    pub const fn descriptor(&self) -> &MachineDescriptor {
        &self.descriptor
    }

    /// Provider-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> &MachineId {
        &self.descriptor.id
    }

    /// Number of poll-interval sleeps spent waiting for activation.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }
}

/// Per-session tunnel options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    /// Subnet routed through the tunnel.
    pub subnet: String,
    /// Whether DNS is proxied.
    pub proxy_dns: bool,
    /// Extra tunnel arguments, tokenised like a shell would.
    pub extra_args: String,
}

/// A started tunnel and the machine it points at.
#[derive(Debug)]
pub struct ConnectedTunnel {
    /// Running session.
    pub session: TunnelSession,
    /// Login target on the machine.
    pub target: RemoteTarget,
}

/// Final result of a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowOutcome {
    /// Machine the tunnel ran against.
    pub machine: MachineDescriptor,
    /// How the tunnel ended.
    pub exit: TunnelExit,
}

/// Errors surfaced by the workflow.
#[derive(Debug, Error)]
pub enum WorkflowError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the account's SSH keys cannot be listed.
    #[error("failed to list SSH keys: {0}")]
    KeyLookup(#[source] ProviderError),
    /// Raised when the create call fails.
    #[error("failed to create machine: {0}")]
    Provision(#[source] ProviderError),
    /// Raised when a status check fails.
    #[error("failed to fetch status of machine {machine_id}: {source}")]
    Status {
        /// Machine being polled.
        machine_id: MachineId,
        /// Provider-specific error.
        #[source]
        source: ProviderError,
    },
    /// Raised when the retry budget runs out. The machine is left running.
    #[error(
        "machine {machine_id} did not become active after {attempts} status checks; it was left running"
    )]
    Timeout {
        /// Machine being polled.
        machine_id: MachineId,
        /// Number of status checks made.
        attempts: u32,
    },
    /// Raised when the machine reaches a status it cannot leave.
    #[error("machine {machine_id} reached terminal status {status}")]
    Terminal {
        /// Machine being polled.
        machine_id: MachineId,
        /// Terminal status reported by the provider.
        status: MachineStatus,
    },
    /// Raised when connecting to a machine that is not active.
    #[error("machine {machine_id} is {status}, not active")]
    NotActive {
        /// Machine being connected to.
        machine_id: MachineId,
        /// Status reported by the provider.
        status: MachineStatus,
    },
    /// Raised when an active machine has no public address.
    #[error("machine {machine_id} has no public IP address")]
    MissingAddress {
        /// Machine being connected to.
        machine_id: MachineId,
    },
    /// Raised when the watchdog's destroy URL cannot be built.
    #[error("failed to build self-destruct URL: {0}")]
    DestructUrl(#[source] ProviderError),
    /// Raised when the watchdog cannot be installed.
    #[error(transparent)]
    SelfDestruct(#[from] SelfDestructError),
    /// Raised when the tunnel cannot be started or supervised.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Drives provisioning, tunnelling, and teardown for one invocation.
#[derive(Debug)]
pub struct ProvisioningWorkflow<P, T, X> {
    provider: P,
    tunnel: T,
    self_destruct: SelfDestruct<X>,
    policy: DestructionPolicy,
    max_retries: u32,
    initial_delay: Duration,
    poll_interval: Duration,
    ssh_user: String,
}

impl<P, T, X> ProvisioningWorkflow<P, T, X>
where
    P: Provider + Clone + Send + Sync + 'static,
    T: Tunnel + Clone + Send + 'static,
    X: RemoteExecutor + Clone + Send + 'static,
{
    /// Creates a workflow with default timings.
    #[must_use]
    pub fn new(
        provider: P,
        tunnel: T,
        self_destruct: SelfDestruct<X>,
        policy: DestructionPolicy,
    ) -> Self {
        Self {
            provider,
            tunnel,
            self_destruct,
            policy,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ssh_user: DEFAULT_SSH_USER.to_owned(),
        }
    }

    /// Overrides the status-check budget. Values below one are raised to one.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Overrides the wait between creation and the first status check.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Overrides the wait between status checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the remote login user.
    #[must_use]
    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    /// Returns the provider, mainly for inspection in tests.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Every SSH key registered to the account.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::KeyLookup`] when the provider call fails.
    pub async fn account_keys(&self) -> Result<Vec<SshKeyId>, WorkflowError<P::Error>> {
        let keys = self
            .provider
            .list_ssh_keys()
            .await
            .map_err(WorkflowError::KeyLookup)?;
        debug!(count = keys.len(), "loaded account SSH keys");
        Ok(keys)
    }

    /// Creates or adopts a machine and waits until it is active.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Provision`] when creation fails, or the
    /// polling errors described on [`Self::poll_until_active`].
    pub async fn provision(
        &self,
        source: MachineSource,
    ) -> Result<ActiveMachine, WorkflowError<P::Error>> {
        let result = match source {
            MachineSource::Create(request) => self.create_and_wait(&request).await,
            MachineSource::Existing(descriptor) if descriptor.status.is_active() => {
                info!(
                    state = %WorkflowState::Active,
                    machine_id = %descriptor.id,
                    "using supplied machine state"
                );
                Ok(ActiveMachine {
                    descriptor,
                    retries: 0,
                })
            }
            MachineSource::Existing(descriptor) => {
                info!(
                    machine_id = %descriptor.id,
                    status = %descriptor.status,
                    "supplied machine is not active yet"
                );
                self.poll_until_active(&descriptor.id).await
            }
        };
        result.inspect_err(log_failure)
    }

    async fn create_and_wait(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ActiveMachine, WorkflowError<P::Error>> {
        info!(
            state = %WorkflowState::Requesting,
            name = %request.name,
            region = %request.region,
            size = %request.size,
            image = %request.image,
            "creating machine"
        );
        let created = self
            .provider
            .create_machine(request)
            .await
            .map_err(WorkflowError::Provision)?;
        info!(
            machine_id = %created.id,
            delay_secs = self.initial_delay.as_secs(),
            "machine created, waiting before first status check"
        );
        sleep(self.initial_delay).await;
        self.poll_until_active(&created.id).await
    }

    /// Polls the machine until it reports `active`.
    ///
    /// At most `max_retries` status checks are made, with one poll-interval
    /// sleep between consecutive checks.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Status`] when a status call fails,
    /// [`WorkflowError::Terminal`] when the machine is archived, or
    /// [`WorkflowError::Timeout`] when the budget runs out.
    pub async fn poll_until_active(
        &self,
        id: &MachineId,
    ) -> Result<ActiveMachine, WorkflowError<P::Error>> {
        info!(state = %WorkflowState::Polling, machine_id = %id, "waiting for machine");
        let mut retries = 0;
        for attempt in 1..=self.max_retries {
            let descriptor =
                self.provider
                    .machine_status(id)
                    .await
                    .map_err(|source| WorkflowError::Status {
                        machine_id: id.clone(),
                        source,
                    })?;

            if descriptor.status.is_active() {
                info!(
                    state = %WorkflowState::Active,
                    machine_id = %id,
                    address = ?descriptor.ip_address,
                    "machine is active"
                );
                return Ok(ActiveMachine {
                    descriptor,
                    retries,
                });
            }
            if descriptor.status.is_terminal() {
                return Err(WorkflowError::Terminal {
                    machine_id: id.clone(),
                    status: descriptor.status,
                });
            }
            if descriptor.status == MachineStatus::New {
                debug!(attempt, machine_id = %id, "machine still being built");
            } else {
                warn!(
                    attempt,
                    machine_id = %id,
                    status = %descriptor.status,
                    "unexpected machine status, retrying"
                );
            }

            if attempt < self.max_retries {
                sleep(self.poll_interval).await;
                retries += 1;
            }
        }

        Err(WorkflowError::Timeout {
            machine_id: id.clone(),
            attempts: self.max_retries,
        })
    }

    /// Starts the tunnel against an active machine. Locating (and possibly
    /// cloning) the tunnel tool runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::NotActive`] or
    /// [`WorkflowError::MissingAddress`] when the machine is not usable, or
    /// [`WorkflowError::Tunnel`] when the tunnel cannot start.
    pub async fn connect(
        &self,
        machine: &ActiveMachine,
        options: &SessionOptions,
    ) -> Result<ConnectedTunnel, WorkflowError<P::Error>> {
        let descriptor = machine.descriptor();
        if !descriptor.status.is_active() {
            return Err(WorkflowError::NotActive {
                machine_id: descriptor.id.clone(),
                status: descriptor.status.clone(),
            });
        }
        let host = descriptor
            .ip_address
            .ok_or_else(|| WorkflowError::MissingAddress {
                machine_id: descriptor.id.clone(),
            })?;
        let target = RemoteTarget {
            user: self.ssh_user.clone(),
            host,
        };
        info!(state = %WorkflowState::Connecting, target = %target, "starting tunnel");

        let tunnel = self.tunnel.clone();
        let executable = spawn_blocking(move || tunnel.resolve_executable())
            .await
            .map_err(|err| TunnelError::Join(err.to_string()))??;
        let spec = SessionSpec {
            remote: target.to_string(),
            subnet: options.subnet.clone(),
            proxy_dns: options.proxy_dns,
            extra_args: options.extra_args.clone(),
        };
        let session = self.tunnel.start_session(
            &executable,
            &spec,
            self.teardown_callback(descriptor.id.clone()),
        )?;
        info!(state = %WorkflowState::Connected, target = %target, "tunnel running");
        Ok(ConnectedTunnel { session, target })
    }

    /// Builds the callback run when the tunnel exits. It destroys the machine
    /// only for failure exits, and only when the policy allows it.
    #[must_use]
    pub fn teardown_callback(&self, id: MachineId) -> ExitCallback {
        let provider = self.provider.clone();
        let policy = self.policy;
        Box::new(move |exit: TunnelExit| -> ExitFuture {
            Box::pin(async move {
                if !exit.is_failure() {
                    info!(state = %WorkflowState::Done, machine_id = %id, "tunnel exited cleanly");
                    return;
                }
                if !policy.destroy_on_exit {
                    info!(
                        state = %WorkflowState::Done,
                        machine_id = %id,
                        code = ?exit.code,
                        "tunnel failed, keeping machine"
                    );
                    return;
                }
                info!(
                    state = %WorkflowState::TearingDown,
                    machine_id = %id,
                    code = ?exit.code,
                    "tunnel failed, destroying machine"
                );
                match provider.destroy(&id, policy.scrub).await {
                    Ok(()) => info!(machine_id = %id, "machine destroyed"),
                    Err(err) => warn!(machine_id = %id, error = %err, "failed to destroy machine"),
                }
                info!(state = %WorkflowState::Done, machine_id = %id, "teardown finished");
            })
        })
    }

    /// Installs the remote watchdog when the policy configures a timeout.
    /// Returns whether anything was installed. The `ssh` call runs on the
    /// blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DestructUrl`] or
    /// [`WorkflowError::SelfDestruct`] when installation fails.
    pub async fn install_self_destruct(
        &self,
        machine: &ActiveMachine,
        target: &RemoteTarget,
    ) -> Result<bool, WorkflowError<P::Error>> {
        let Some(timeout) = self.policy.self_destruct_timeout else {
            debug!("self-destruct disabled");
            return Ok(false);
        };
        let url = self
            .provider
            .destruct_url(machine.id(), self.policy.scrub)
            .map_err(WorkflowError::DestructUrl)?;
        let installer = self.self_destruct.clone();
        let target = target.clone();
        spawn_blocking(move || installer.install(&target, &url, timeout))
            .await
            .map_err(|err| SelfDestructError::Join(err.to_string()))??;
        Ok(true)
    }

    /// Connects, installs the watchdog, and waits for the tunnel (and any
    /// teardown) to finish. Watchdog failures are logged, never fatal.
    ///
    /// # Errors
    ///
    /// Returns the errors described on [`Self::connect`], or
    /// [`WorkflowError::Tunnel`] when the session task fails.
    pub async fn run_tunnel(
        &self,
        machine: &ActiveMachine,
        options: &SessionOptions,
    ) -> Result<WorkflowOutcome, WorkflowError<P::Error>> {
        let connected = self
            .connect(machine, options)
            .await
            .inspect_err(log_failure)?;
        if let Err(err) = self
            .install_self_destruct(machine, &connected.target)
            .await
        {
            warn!(error = %err, "continuing without self-destruct");
        }
        let exit = connected.session.wait().await.inspect_err(|err| {
            warn!(state = %WorkflowState::Failed, error = %err, "tunnel supervisor failed");
        })?;
        Ok(WorkflowOutcome {
            machine: machine.descriptor().clone(),
            exit,
        })
    }

    /// Provisions a machine and runs the tunnel against it.
    ///
    /// # Errors
    ///
    /// Returns the errors described on [`Self::provision`] and
    /// [`Self::run_tunnel`].
    pub async fn execute(
        &self,
        source: MachineSource,
        options: &SessionOptions,
    ) -> Result<WorkflowOutcome, WorkflowError<P::Error>> {
        let machine = self.provision(source).await?;
        self.run_tunnel(&machine, options).await
    }
}

fn log_failure<E: std::error::Error + 'static>(err: &WorkflowError<E>) {
    warn!(state = %WorkflowState::Failed, error = %err, "workflow stopped");
}
