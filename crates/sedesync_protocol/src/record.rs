//! Change records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ConflictId, GlobalId, SiteId};
use crate::payload::{feed_str, Fingerprint, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of mutation a record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Record was created.
    Create,
    /// Record was updated.
    Update,
    /// Record was deleted.
    Delete,
}

impl Operation {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            Operation::Create => 1,
            Operation::Update => 2,
            Operation::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Operation::Create),
            2 => Some(Operation::Update),
            3 => Some(Operation::Delete),
            _ => None,
        }
    }

    /// Returns true if records of this kind carry a payload.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }

    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a change record.
///
/// ```text
/// PENDING ──► SYNCED
///    │  ▲
///    ▼  │ (explicit retry)
///  FAILED
/// ```
///
/// SYNCED is terminal; only retention cleanup removes such records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    /// Waiting to be delivered.
    Pending,
    /// Delivered and applied.
    Synced,
    /// Delivery failed; see the error detail.
    Failed,
}

impl RecordStatus {
    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::Synced)
                | (RecordStatus::Pending, RecordStatus::Failed)
                | (RecordStatus::Failed, RecordStatus::Pending)
        )
    }

    /// Validates a transition.
    pub fn transition_to(&self, next: RecordStatus) -> ProtocolResult<RecordStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProtocolError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Synced => "SYNCED",
            RecordStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RecordStatus::Pending),
            "SYNCED" => Ok(RecordStatus::Synced),
            "FAILED" => Ok(RecordStatus::Failed),
            _ => Err(ProtocolError::Malformed(format!("unknown status {s}"))),
        }
    }
}

/// Idempotence key of a change: the site it was captured at and the
/// sequence it had there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OriginKey {
    /// Site where the change was captured.
    pub site: SiteId,
    /// Sequence at that site.
    pub sequence: u64,
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.site, self.sequence)
    }
}

/// One captured mutation, the unit of synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Store-local position. Only meaningful inside one store.
    pub sequence: u64,
    /// Sequence the record had at its origin site.
    pub origin_sequence: u64,
    /// Origin site.
    pub site_id: SiteId,
    /// Entity table name.
    pub table: String,
    /// Record global identifier.
    pub global_id: GlobalId,
    /// Site-local numeric id, informational only.
    pub local_id: Option<i64>,
    /// Mutation kind.
    pub operation: Operation,
    /// Full field snapshot; absent for DELETE.
    pub payload: Option<Snapshot>,
    /// Delivery status.
    pub status: RecordStatus,
    /// Failure detail; present only when FAILED.
    pub error_detail: Option<String>,
    /// Open conflict this record is held behind.
    pub conflict: Option<ConflictId>,
    /// Conflict this record resolves, if it is a resolution.
    pub resolves: Option<ConflictId>,
    /// When the originating client observed the change.
    pub client_created_at: DateTime<Utc>,
    /// When this store received the record.
    pub received_at: DateTime<Utc>,
    /// Last status change in this store.
    pub updated_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Builds a freshly captured PENDING record.
    ///
    /// Sequence numbers are zero until the record is appended to a store.
    pub fn captured(
        site_id: SiteId,
        table: impl Into<String>,
        global_id: GlobalId,
        operation: Operation,
        payload: Option<Snapshot>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            origin_sequence: 0,
            site_id,
            table: table.into(),
            global_id,
            local_id: None,
            operation,
            payload,
            status: RecordStatus::Pending,
            error_detail: None,
            conflict: None,
            resolves: None,
            client_created_at: at,
            received_at: at,
            updated_at: at,
        }
    }

    /// Sets the local id.
    #[must_use]
    pub fn with_local_id(mut self, local_id: Option<i64>) -> Self {
        self.local_id = local_id;
        self
    }

    /// Returns the idempotence key.
    pub fn origin_key(&self) -> OriginKey {
        OriginKey {
            site: self.site_id,
            sequence: self.origin_sequence,
        }
    }

    /// Returns true while the record still has to reach a peer.
    pub fn is_unsynced(&self) -> bool {
        self.status != RecordStatus::Synced
    }

    /// Returns true if the record is held behind an open conflict.
    pub fn is_flagged(&self) -> bool {
        self.conflict.is_some()
    }

    /// Checks the structural rules every record must satisfy.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.table.trim().is_empty() {
            return Err(ProtocolError::Malformed("empty table name".into()));
        }
        if self.origin_sequence == 0 {
            return Err(ProtocolError::Malformed("missing origin sequence".into()));
        }
        match (self.operation.carries_payload(), self.payload.is_some()) {
            (true, false) => Err(ProtocolError::Malformed(format!(
                "{} without payload",
                self.operation
            ))),
            (false, true) => Err(ProtocolError::Malformed("DELETE with payload".into())),
            _ => Ok(()),
        }
    }

    /// Digest of the table, id, operation and payload.
    ///
    /// Status, timestamps and sequence numbers are excluded, so a replica
    /// has the same fingerprint as the record it copies.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        feed_str(&mut hasher, &self.table);
        hasher.update(self.global_id.as_bytes());
        hasher.update([self.operation.to_code()]);
        match &self.payload {
            Some(payload) => {
                hasher.update([1u8]);
                payload.feed(&mut hasher);
            }
            None => hasher.update([0u8]),
        }
        Fingerprint::from_hasher(hasher)
    }

    /// Returns true if both records would leave the entity in the same state.
    pub fn agrees_with(&self, other: &ChangeRecord) -> bool {
        let same_kind = match (self.operation, other.operation) {
            (Operation::Delete, Operation::Delete) => true,
            (Operation::Delete, _) | (_, Operation::Delete) => false,
            _ => true,
        };
        same_kind && self.payload == other.payload
    }

    /// Copies an incoming record for storage as a SYNCED replica.
    ///
    /// Origin site and origin sequence are preserved; the store assigns
    /// the local sequence on append.
    pub fn replica(&self, at: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            status: RecordStatus::Synced,
            error_detail: None,
            conflict: None,
            received_at: at,
            updated_at: at,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(operation: Operation, payload: Option<Snapshot>) -> ChangeRecord {
        let mut r = ChangeRecord::captured(
            SiteId::new(),
            "patients",
            GlobalId::new(),
            operation,
            payload,
            Utc::now(),
        );
        r.sequence = 7;
        r.origin_sequence = 7;
        r
    }

    #[test]
    fn operation_codes_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::from_code(op.to_code()), Some(op));
        }
        assert_eq!(Operation::from_code(0), None);
    }

    #[test]
    fn allowed_transitions() {
        use RecordStatus::*;
        assert!(Pending.can_transition_to(Synced));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Synced.can_transition_to(Pending));
        assert!(!Synced.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Synced));
        assert!(!Pending.can_transition_to(Pending));
        assert!(Synced.transition_to(Failed).is_err());
    }

    #[test]
    fn validation_checks_payload_presence() {
        let snapshot = Snapshot::new().with("name", "Ana");
        assert!(record(Operation::Create, Some(snapshot.clone())).validate().is_ok());
        assert!(record(Operation::Delete, None).validate().is_ok());
        assert!(record(Operation::Update, None).validate().is_err());
        assert!(record(Operation::Delete, Some(snapshot)).validate().is_err());

        let mut nameless = record(Operation::Delete, None);
        nameless.table = "  ".into();
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn replica_keeps_identity_and_fingerprint() {
        let original = record(Operation::Update, Some(Snapshot::new().with("x", 1i64)));
        let replica = original.replica(Utc::now());

        assert_eq!(replica.sequence, 0);
        assert_eq!(replica.status, RecordStatus::Synced);
        assert_eq!(replica.origin_key(), original.origin_key());
        assert_eq!(replica.fingerprint(), original.fingerprint());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = record(Operation::Update, Some(Snapshot::new().with("x", 1i64)));
        let mut b = a.clone();
        b.payload = Some(Snapshot::new().with("x", 2i64));
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.status = RecordStatus::Failed;
        c.error_detail = Some("boom".into());
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn agreement_ignores_create_vs_update() {
        let snapshot = Snapshot::new().with("x", 1i64);
        let create = record(Operation::Create, Some(snapshot.clone()));
        let update = record(Operation::Update, Some(snapshot));
        let delete = record(Operation::Delete, None);

        assert!(create.agrees_with(&update));
        assert!(!update.agrees_with(&delete));
        assert!(delete.agrees_with(&record(Operation::Delete, None)));
    }
}
