//! Per-record apply outcomes.

use crate::ids::ConflictId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an incoming record could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    /// The record breaks a structural rule.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// UPDATE or DELETE for a record never seen here.
    #[error("unknown record")]
    UnknownRecord,

    /// UPDATE for a record that has been deleted.
    #[error("record already deleted")]
    AlreadyDeleted,

    /// CREATE for a live record with different contents.
    #[error("record already exists with different contents")]
    AlreadyExists,

    /// A later change from the same origin was already applied.
    #[error("out of order: origin sequence {incoming} after {applied}")]
    OutOfOrder {
        /// Highest origin sequence already applied.
        applied: u64,
        /// Origin sequence of the incoming record.
        incoming: u64,
    },

    /// The idempotence key was already used for different contents.
    #[error("origin key reused with different contents")]
    FingerprintMismatch,

    /// An earlier change to the same record failed.
    #[error("blocked by earlier failure")]
    BlockedByEarlierFailure,

    /// The record came from a site other than the one pushing it.
    #[error("record does not originate at the pushing site")]
    ForeignOrigin,
}

/// Result of applying one incoming record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The record was applied, or had already been applied.
    Applied {
        /// True if this was a replay of an already applied record.
        duplicate: bool,
    },
    /// The record competes with an unsynchronized change and was held.
    Conflict {
        /// Conflict the record is held behind.
        conflict_id: ConflictId,
        /// True if this record opened the conflict.
        opened: bool,
    },
    /// The record cannot be applied.
    Rejected {
        /// Why.
        reason: RejectReason,
    },
}

impl ApplyOutcome {
    /// Shorthand for a first-time application.
    pub fn applied() -> Self {
        ApplyOutcome::Applied { duplicate: false }
    }

    /// Shorthand for a rejection.
    pub fn rejected(reason: RejectReason) -> Self {
        ApplyOutcome::Rejected { reason }
    }

    /// Returns true for `Applied`.
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    /// Returns true for `Conflict`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyOutcome::Conflict { .. })
    }

    /// Returns true for `Rejected`.
    pub fn is_rejected(&self) -> bool {
        matches!(self, ApplyOutcome::Rejected { .. })
    }
}
