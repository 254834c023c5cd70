//! Error types for the sync protocol.

use crate::record::RecordStatus;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, validating or coding protocol values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A value could not be encoded to CBOR.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded from CBOR.
    #[error("decode error: {0}")]
    Decode(String),

    /// An identifier string was not a valid UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A site code outside the known set.
    #[error("unknown site code: {0}")]
    UnknownSiteCode(String),

    /// A change record is structurally invalid.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// A status transition outside the allowed set.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: RecordStatus,
        /// Requested status.
        to: RecordStatus,
    },

    /// An unrecognized conflict decision name.
    #[error("unknown conflict decision: {0}")]
    UnknownDecision(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let err = ProtocolError::InvalidTransition {
            from: RecordStatus::Synced,
            to: RecordStatus::Pending,
        };
        let msg = err.to_string();
        assert!(msg.contains("SYNCED"));
        assert!(msg.contains("PENDING"));
    }
}
