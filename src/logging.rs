//! Logging setup for the `instavpn` binary.
//!
//! Logs go to stderr so stdout stays free for the machine state line.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Noisy dependencies kept at `warn` unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &str = "hyper=warn,reqwest=warn,rustls=warn";

/// Picks the crate log level from the verbosity flags.
#[must_use]
pub const fn level_for(verbose: bool, quiet: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    }
}

/// Builds the filter: `RUST_LOG` when set, otherwise `level` for everything
/// except known-noisy dependencies.
#[must_use]
pub fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{QUIET_DEPENDENCIES},{level}")))
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_err() {
        tracing::debug!("logging already initialised");
    }
}
