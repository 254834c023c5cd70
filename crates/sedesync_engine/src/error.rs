//! Error types for the sync engine.

use sedesync_protocol::{ProtocolError, SiteId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort a sync operation.
///
/// Per-record failures are not errors; they are reported as outcomes.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The peer did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The transport was closed.
    #[error("not connected to peer")]
    NotConnected,

    /// The peer answered with something that does not fit the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Core(#[from] sedesync_core::CoreError),

    /// Another run holds the site's lease.
    #[error("run in progress for site {0}")]
    RunInProgress(SiteId),

    /// The site is not registered with the engine.
    #[error("unknown site {0}")]
    UnknownSite(SiteId),

    /// The run was cancelled between batches.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the peer could not be reached or did not answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::NotConnected
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
