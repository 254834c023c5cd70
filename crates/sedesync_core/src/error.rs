//! Error types for SedeSync core.

use sedesync_protocol::{ConflictId, GlobalId, ProtocolError, RecordStatus};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol-level error (codec, validation, status machine).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A journal file is damaged beyond its tail.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the node directory.
    #[error("node directory locked: another process has exclusive access")]
    NodeLocked,

    /// Invalid node directory layout or identity.
    #[error("invalid node directory: {message}")]
    InvalidFormat {
        /// Description of the issue.
        message: String,
    },

    /// No record with this sequence.
    #[error("change record {sequence} not found")]
    RecordNotFound {
        /// Requested sequence.
        sequence: u64,
    },

    /// A compare-and-set transition found a different status.
    #[error("change record {sequence} is {actual}, expected {expected}")]
    StatusMismatch {
        /// Record sequence.
        sequence: u64,
        /// Status the caller expected.
        expected: RecordStatus,
        /// Status actually stored.
        actual: RecordStatus,
    },

    /// No live entity with this identifier.
    #[error("entity {table}/{global_id} not found")]
    EntityNotFound {
        /// Entity table.
        table: String,
        /// Record identifier.
        global_id: GlobalId,
    },

    /// No open conflict with this identifier.
    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    /// The requested resolution cannot be carried out.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// The change capture store refused the record.
    #[error("capture failed: {0}")]
    Capture(String),
}

impl CoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }
}
