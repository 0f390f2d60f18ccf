//! Error types for tunnel launching.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while locating, launching, or supervising the tunnel tool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Raised when the tunnel configuration is incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the tunnel executable is neither installed nor fetchable.
    #[error("tunnel tool unavailable: {0}")]
    ToolUnavailable(String),
    /// Raised when the tunnel argument vector cannot be built.
    #[error("invalid tunnel arguments: {0}")]
    InvalidArguments(String),
    /// Raised when the tunnel process cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Executable that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the supervising task or the executable lookup panics or
    /// is cancelled.
    #[error("tunnel supervisor failed: {0}")]
    Join(String),
}
