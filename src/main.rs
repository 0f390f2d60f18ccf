//! Binary entry point for the `instavpn` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::error;

use instavpn::{
    ConfigError, DestructionPolicy, DigitalOceanClient, InstavpnConfig, Interrupts,
    MachineDescriptor, MachineSource, ProviderError, ProvisioningRequest, ProvisioningWorkflow,
    SelfDestruct, SelfDestructError, SessionOptions, SshKeyId, SshRemoteExecutor,
    SshuttleLauncher, TunnelConfig, TunnelError, ValidationError, WatchdogScript, WorkflowError,
    logging, validate_machine_name,
};

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    SelfDestruct(#[from] SelfDestructError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError<ProviderError>),
    #[error("failed to print machine state: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(logging::level_for(cli.verbose, cli.quiet));

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    if let Some(name) = cli.name.as_deref() {
        validate_machine_name(name.trim())?;
    }
    let debug_state = cli
        .debug_state
        .as_deref()
        .map(MachineDescriptor::from_state_json)
        .transpose()?;

    let config = InstavpnConfig::load_without_cli_args()?;
    config.validate()?;
    let tunnel_config = TunnelConfig::load_without_cli_args()?;

    // Built before any provider call so a bad configured name never reaches
    // the network.
    let mut source = match debug_state {
        Some(descriptor) => MachineSource::Existing(descriptor),
        None => MachineSource::Create(provisioning_request(
            &cli,
            &config,
            selected_keys(&cli, &config),
        )?),
    };

    let client = DigitalOceanClient::new(&config)?;
    let script = match &config.self_destruct_template {
        Some(path) => WatchdogScript::from_file(path)?,
        None => WatchdogScript::builtin(),
    };
    let self_destruct = SelfDestruct::new(
        SshRemoteExecutor::with_process_runner(&tunnel_config.ssh_bin),
        script,
        &config.watch_pattern,
    );
    let options = session_options(&cli, &tunnel_config);
    let ssh_user = tunnel_config.ssh_user.clone();
    let launcher = SshuttleLauncher::with_process_runner(tunnel_config, Interrupts::new())?;
    let workflow = ProvisioningWorkflow::new(
        client,
        launcher,
        self_destruct,
        destruction_policy(&cli, &config),
    )
    .with_max_retries(config.max_retries)
    .with_initial_delay(config.initial_delay())
    .with_poll_interval(config.poll_interval())
    .with_ssh_user(ssh_user);

    if cli.all_keys {
        if let MachineSource::Create(request) = &mut source {
            request.ssh_key_ids = workflow.account_keys().await?;
        }
    }

    let machine = workflow.provision(source).await?;
    print_state(io::stdout(), machine.descriptor())?;
    let outcome = workflow.run_tunnel(&machine, &options).await?;
    Ok(outcome.exit.exit_code())
}

fn selected_keys(cli: &Cli, config: &InstavpnConfig) -> Vec<SshKeyId> {
    cli.keys
        .as_deref()
        .map_or_else(|| config.ssh_keys(), SshKeyId::parse_list)
}

fn provisioning_request(
    cli: &Cli,
    config: &InstavpnConfig,
    keys: Vec<SshKeyId>,
) -> Result<ProvisioningRequest, ValidationError> {
    let mut builder = config.request_builder().ssh_key_ids(keys);
    if let Some(region) = &cli.region {
        builder = builder.region(region);
    }
    if let Some(size) = &cli.size {
        builder = builder.size(size);
    }
    if let Some(image) = &cli.image {
        builder = builder.image(image);
    }
    if let Some(name) = &cli.name {
        builder = builder.name(name);
    }
    builder.build()
}

fn destruction_policy(cli: &Cli, config: &InstavpnConfig) -> DestructionPolicy {
    let timeout = cli
        .self_destruct_timeout
        .unwrap_or(config.self_destruct_timeout_secs);
    DestructionPolicy {
        destroy_on_exit: config.destroy_on_exit && !cli.keep_machine,
        scrub: cli.scrub || config.scrub,
        self_destruct_timeout: (config.self_destruct && !cli.no_self_destruct)
            .then_some(Duration::from_secs(timeout)),
    }
}

fn session_options(cli: &Cli, tunnel: &TunnelConfig) -> SessionOptions {
    SessionOptions {
        subnet: cli.subnet.clone().unwrap_or_else(|| tunnel.subnet.clone()),
        proxy_dns: cli.dns || tunnel.proxy_dns,
        extra_args: cli
            .params
            .clone()
            .unwrap_or_else(|| tunnel.extra_args.clone()),
    }
}

fn print_state(mut target: impl Write, descriptor: &MachineDescriptor) -> Result<(), CliError> {
    let json = descriptor.to_state_json()?;
    writeln!(target, "{json}").map_err(|err| CliError::Output(err.to_string()))
}
