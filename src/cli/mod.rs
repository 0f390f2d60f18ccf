//! Command-line interface definitions for the `instavpn` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `instavpn` binary.
#[derive(Debug, Parser)]
#[command(
    name = "instavpn",
    version,
    about = "Instant sshuttle VPN through a throwaway DigitalOcean droplet"
)]
pub(crate) struct Cli {
    /// Proxy DNS queries through the tunnel.
    #[arg(short = 'd', long = "dns")]
    pub(crate) dns: bool,
    /// Subnet routed through the tunnel (defaults to everything, `0/0`).
    #[arg(short = 'l', long, value_name = "CIDR")]
    pub(crate) subnet: Option<String>,
    /// Extra sshuttle arguments, split like a shell would.
    #[arg(short = 'p', long = "params", value_name = "ARGS", allow_hyphen_values = true)]
    pub(crate) params: Option<String>,
    /// Do not install the remote self-destruct watchdog.
    ///
    /// The machine is still destroyed when sshuttle exits with a failure.
    #[arg(long)]
    pub(crate) no_self_destruct: bool,
    /// Seconds without a tunnel before the watchdog destroys the machine.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) self_destruct_timeout: Option<u64>,
    /// Scrub the machine's disk when destroying it.
    #[arg(long)]
    pub(crate) scrub: bool,
    /// Keep the machine when sshuttle exits with a failure.
    #[arg(long)]
    pub(crate) keep_machine: bool,
    /// Region slug (for example `nyc1`) or numeric region ID.
    #[arg(short = 'r', long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Machine name; only hostname characters (a-z, A-Z, 0-9, . and -).
    #[arg(short = 'n', long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Size slug (for example `512mb`) or numeric size ID.
    #[arg(short = 's', long, value_name = "SIZE")]
    pub(crate) size: Option<String>,
    /// Image slug or numeric image ID.
    #[arg(short = 'i', long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Install every SSH key registered to the account.
    #[arg(long, conflicts_with = "keys")]
    pub(crate) all_keys: bool,
    /// Comma-separated SSH key IDs to install on the machine.
    #[arg(short = 'k', long, value_name = "IDS")]
    pub(crate) keys: Option<String>,
    /// Skip creation and connect to the machine in this state JSON, as
    /// printed by a previous run.
    #[arg(long, value_name = "JSON")]
    pub(crate) debug_state: Option<String>,
    /// Log debug details.
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub(crate) verbose: bool,
    /// Only log warnings and errors.
    #[arg(short = 'q', long)]
    pub(crate) quiet: bool,
}
