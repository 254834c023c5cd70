//! # SedeSync Protocol
//!
//! Change record types and wire messages for SedeSync.
//!
//! This crate provides:
//! - Identifiers for sites, records and conflicts
//! - `ChangeRecord`, the unit of synchronization, and its status machine
//! - Field snapshots and their fingerprints
//! - Apply outcomes and conflict entries
//! - Protocol messages (Push, Pull, FullSync) and their CBOR codec
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod error;
mod ids;
mod messages;
mod outcome;
mod payload;
mod record;
mod site;

pub use codec::{decode_cbor, encode_cbor, CborMessage};
pub use conflict::{ConflictDecision, ConflictEntry, Direction};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ConflictId, GlobalId, SiteId};
pub use messages::{
    FullSyncRequest, FullSyncResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    RecordOutcome, SnapshotRow, SyncMessage, TableSnapshot,
};
pub use outcome::{ApplyOutcome, RejectReason};
pub use payload::{FieldValue, Fingerprint, Snapshot};
pub use record::{ChangeRecord, OriginKey, Operation, RecordStatus};
pub use site::{Site, SiteCode};
