//! Protocol messages exchanged between a site and its hub.

use crate::codec::CborMessage;
use crate::ids::{GlobalId, SiteId};
use crate::outcome::ApplyOutcome;
use crate::payload::Snapshot;
use crate::record::ChangeRecord;
use serde::{Deserialize, Serialize};

/// Ordered batch of a site's PENDING records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Pushing site.
    pub origin: SiteId,
    /// The pusher's pull watermark on the receiving peer. Changes the
    /// receiver holds above it have not been seen by the pusher.
    pub expected_cursor: Option<u64>,
    /// Records in sequence order.
    pub records: Vec<ChangeRecord>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(origin: SiteId, expected_cursor: Option<u64>, records: Vec<ChangeRecord>) -> Self {
        Self {
            origin,
            expected_cursor,
            records,
        }
    }
}

/// Outcome for one pushed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Sequence of the record at the pushing site.
    pub sequence: u64,
    /// Record identifier.
    pub global_id: GlobalId,
    /// What happened.
    pub outcome: ApplyOutcome,
}

/// One outcome per pushed record, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Per-record outcomes.
    pub outcomes: Vec<RecordOutcome>,
}

/// Request for changes above a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting site; its own changes are not returned.
    pub site: SiteId,
    /// Return changes strictly above this cursor.
    pub since: u64,
    /// Restrict to these tables.
    pub tables: Option<Vec<String>>,
    /// Maximum records per page.
    pub limit: u32,
}

impl PullRequest {
    /// Creates an unscoped pull request.
    pub fn new(site: SiteId, since: u64, limit: u32) -> Self {
        Self {
            site,
            since,
            tables: None,
            limit,
        }
    }

    /// Restricts the request to the given tables.
    #[must_use]
    pub fn with_tables(mut self, tables: Option<Vec<String>>) -> Self {
        self.tables = tables;
        self
    }
}

/// A page of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Records in the peer's log order.
    pub records: Vec<ChangeRecord>,
    /// Cursor to send with the next request.
    pub new_cursor: u64,
    /// Whether more records are available.
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(records: Vec<ChangeRecord>, new_cursor: u64, has_more: bool) -> Self {
        Self {
            records,
            new_cursor,
            has_more,
        }
    }
}

/// Request for the canonical live contents of tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncRequest {
    /// Requesting site.
    pub site: SiteId,
    /// Tables to fetch; all known tables when absent.
    pub tables: Option<Vec<String>>,
}

/// One live record in a table snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Record identifier.
    pub global_id: GlobalId,
    /// Owning site.
    pub site_id: SiteId,
    /// Local id at the owning site.
    pub local_id: Option<i64>,
    /// Current fields.
    pub payload: Snapshot,
}

/// Canonical live contents of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Live rows.
    pub rows: Vec<SnapshotRow>,
}

/// Table snapshots plus the log position they reflect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncResponse {
    /// Peer log head at snapshot time.
    pub cursor: u64,
    /// One entry per table.
    pub tables: Vec<TableSnapshot>,
}

/// Envelope for dispatching any message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Full sync request.
    FullSyncRequest(FullSyncRequest),
    /// Full sync response.
    FullSyncResponse(FullSyncResponse),
}

impl CborMessage for PushRequest {}
impl CborMessage for PushResponse {}
impl CborMessage for PullRequest {}
impl CborMessage for PullResponse {}
impl CborMessage for FullSyncRequest {}
impl CborMessage for FullSyncResponse {}
impl CborMessage for SyncMessage {}
