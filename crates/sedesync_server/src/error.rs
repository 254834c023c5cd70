//! Error types for the hub.

use sedesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that fail a whole request.
///
/// Per-record problems are outcomes in the push response, not errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The request body could not be decoded or makes no sense.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The push carried more records than allowed.
    #[error("batch too large: {size} > {max}")]
    BatchTooLarge {
        /// Records in the request.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// No handler for the path.
    #[error("unknown path: {0}")]
    UnknownPath(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] sedesync_core::CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::BatchTooLarge { .. }
                | ServerError::UnknownPath(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::UnknownPath(_) => 404,
            ServerError::BatchTooLarge { .. } => 413,
            ServerError::InvalidRequest(_) => 400,
            ServerError::Storage(_) | ServerError::Internal(_) => 500,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(message) => ServerError::Internal(message),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}
