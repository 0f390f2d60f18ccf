//! Core library for the `instavpn` tool.
//!
//! The crate provisions a throwaway DigitalOcean machine, waits for it to
//! become active, and tunnels traffic through it with `sshuttle`. A remote
//! watchdog can destroy the machine once the tunnel goes away, and a failed
//! tunnel exit destroys it locally.

pub mod command;
pub mod config;
pub mod digitalocean;
pub mod interrupt;
pub mod logging;
pub mod provider;
pub mod self_destruct;
pub mod test_support;
pub mod tunnel;
pub mod workflow;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, InstavpnConfig};
pub use digitalocean::{DigitalOceanClient, ProviderError};
pub use interrupt::Interrupts;
pub use provider::{
    MachineDescriptor, MachineId, MachineStatus, Provider, ProvisioningRequest,
    ProvisioningRequestBuilder, SshKeyId, ValidationError, validate_machine_name,
};
pub use self_destruct::{
    RemoteExecutor, RemoteTarget, SelfDestruct, SelfDestructError, SshRemoteExecutor,
    WatchdogScript,
};
pub use tunnel::{
    SessionSpec, SshuttleLauncher, Tunnel, TunnelConfig, TunnelError, TunnelExit, TunnelSession,
};
pub use workflow::{
    ActiveMachine, DestructionPolicy, MachineSource, ProvisioningWorkflow, SessionOptions,
    WorkflowError, WorkflowOutcome,
};
