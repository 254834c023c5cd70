//! CLI error types.

use sedesync_core::CoreError;
use sedesync_engine::SyncError;
use sedesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported to the operator.
#[derive(Error, Debug)]
pub enum CliError {
    /// The command talks to the hub but no hub directory was given.
    #[error("{0} needs the hub directory (--hub)")]
    HubRequired(&'static str),

    /// A flag or argument could not be parsed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Node storage failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A sync call failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The hub refused to start.
    #[error("hub: {0}")]
    Hub(#[from] sedesync_server::ServerError),

    /// Output could not be rendered.
    #[error("output: {0}")]
    Output(#[from] serde_json::Error),
}

impl From<ProtocolError> for CliError {
    fn from(err: ProtocolError) -> Self {
        CliError::InvalidArgument(err.to_string())
    }
}
