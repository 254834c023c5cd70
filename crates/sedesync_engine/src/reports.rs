//! Structured results of operator operations.

use crate::state::{SyncState, SyncStats};
use chrono::{DateTime, Utc};
use sedesync_core::{StatusCounts, TableReconcile};
use sedesync_protocol::{
    ApplyOutcome, ChangeRecord, GlobalId, OriginKey, RecordOutcome, RejectReason, Site, SiteId,
};
use serde::Serialize;

/// Result of pushing a site's PENDING records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Pushing site.
    pub site: SiteId,
    /// Batches sent to the peer.
    pub batches: usize,
    /// One outcome per record handled, in sequence order.
    pub outcomes: Vec<RecordOutcome>,
    /// Records now SYNCED.
    pub synced: usize,
    /// Records held behind a conflict.
    pub conflicts: usize,
    /// Records now FAILED.
    pub failed: usize,
}

impl PushReport {
    pub(crate) fn new(site: SiteId) -> Self {
        Self {
            site,
            batches: 0,
            outcomes: Vec::new(),
            synced: 0,
            conflicts: 0,
            failed: 0,
        }
    }

    pub(crate) fn record(&mut self, record: &ChangeRecord, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied { .. } => self.synced += 1,
            ApplyOutcome::Conflict { .. } => self.conflicts += 1,
            ApplyOutcome::Rejected { .. } => self.failed += 1,
        }
        self.outcomes.push(RecordOutcome {
            sequence: record.sequence,
            global_id: record.global_id,
            outcome,
        });
    }

    /// Records handled, whether sent or settled locally.
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }
}

/// A pulled record that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullFailure {
    /// Idempotence key of the record.
    pub origin: OriginKey,
    /// Entity table.
    pub table: String,
    /// Record identifier.
    pub global_id: GlobalId,
    /// Why it was rejected.
    pub reason: RejectReason,
}

/// Result of pulling from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Pulling site.
    pub site: SiteId,
    /// Table scope, if any.
    pub tables: Option<Vec<String>>,
    /// Pages fetched.
    pub pages: usize,
    /// Records received.
    pub received: usize,
    /// Records applied for the first time.
    pub applied: usize,
    /// Records that had already been applied.
    pub duplicates: usize,
    /// Records held behind a conflict.
    pub conflicts: usize,
    /// Records rejected.
    pub failed: usize,
    /// One entry per rejected record.
    pub failures: Vec<PullFailure>,
    /// Cursor reached.
    pub cursor: u64,
    /// Whether the cursor was stored as the new watermark.
    pub cursor_saved: bool,
}

impl PullReport {
    pub(crate) fn new(site: SiteId, tables: Option<Vec<String>>, since: u64) -> Self {
        Self {
            site,
            tables,
            pages: 0,
            received: 0,
            applied: 0,
            duplicates: 0,
            conflicts: 0,
            failed: 0,
            failures: Vec::new(),
            cursor: since,
            cursor_saved: false,
        }
    }

    pub(crate) fn tally(&mut self, record: &ChangeRecord, outcome: ApplyOutcome) {
        self.received += 1;
        match outcome {
            ApplyOutcome::Applied { duplicate: true } => self.duplicates += 1,
            ApplyOutcome::Applied { duplicate: false } => self.applied += 1,
            ApplyOutcome::Conflict { .. } => self.conflicts += 1,
            ApplyOutcome::Rejected { reason } => {
                self.failed += 1;
                self.failures.push(PullFailure {
                    origin: record.origin_key(),
                    table: record.table.clone(),
                    global_id: record.global_id,
                    reason,
                });
            }
        }
    }
}

/// Result of a full sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullSyncReport {
    /// Reconciled site.
    pub site: SiteId,
    /// Per-table counters.
    pub tables: Vec<TableReconcile>,
    /// Peer cursor captured with the snapshot.
    pub cursor: u64,
    /// Whether the pull watermark was reset to `cursor`.
    pub cursor_reset: bool,
}

impl FullSyncReport {
    /// Rows skipped across all tables.
    pub fn failed(&self) -> usize {
        self.tables.iter().map(|t| t.failed).sum()
    }
}

/// Result of requeueing FAILED records and pushing them again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Sequences moved from FAILED to PENDING.
    pub requeued: Vec<u64>,
    /// The push that followed.
    pub push: PushReport,
}

/// Result of a retention cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Cleaned site.
    pub site: SiteId,
    /// SYNCED records last updated before this instant were deleted.
    pub cutoff: DateTime<Utc>,
    /// Records deleted.
    pub deleted: usize,
}

/// Operator view of one site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// The site.
    pub site: Site,
    /// Runner state.
    pub state: SyncState,
    /// Record counts by status.
    pub counts: StatusCounts,
    /// Open conflicts in the registry.
    pub open_conflicts: usize,
    /// Capture failures since the node was opened.
    pub capture_warnings: u64,
    /// Pull watermark on the peer.
    pub cursor: u64,
    /// Whether a run holds the lease.
    pub lease_held: bool,
    /// Run counters, last success and last error.
    pub stats: SyncStats,
}

/// Result of one incremental run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncrementalReport {
    /// Push half.
    pub push: PushReport,
    /// Pull half.
    pub pull: PullReport,
}

/// What a scheduled run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run finished.
    Completed(IncrementalReport),
    /// Another run held the lease.
    Skipped,
}
