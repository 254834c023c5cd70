//! Change capture.
//!
//! Entity types opt into synchronization by implementing
//! [`SyncableEntity`] and [`SyncHooks`]. The business layer calls the
//! matching hook after every successful local write; the hook appends one
//! PENDING record to the change store.
//!
//! Capture never fails the business operation. When the store refuses a
//! record the failure is logged, counted and kept as a warning the
//! operator can read back.

use crate::store::ChangeStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sedesync_protocol::{ChangeRecord, GlobalId, Operation, SiteId, Snapshot};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Warnings kept for the operator; older ones are dropped first.
pub const MAX_CAPTURE_WARNINGS: usize = 256;

/// A record type that takes part in synchronization.
pub trait SyncableEntity {
    /// Table the entity lives in.
    fn table(&self) -> &str;

    /// Identifier stable across all sites.
    fn global_id(&self) -> GlobalId;

    /// Site that owns the record.
    fn site_id(&self) -> SiteId;

    /// Site-local numeric id, if any.
    fn local_id(&self) -> Option<i64> {
        None
    }

    /// Current field values.
    fn snapshot(&self) -> Snapshot;
}

/// Whether a write should be captured.
///
/// Evaluated per call, so the same entity type can be written with or
/// without capture (for example while loading fixtures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureContext {
    /// Normal writes are captured.
    #[default]
    Syncing,
    /// Writes made in this context produce no change record.
    NonSyncing,
}

/// Result of one capture hook.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// A PENDING record was appended.
    Captured(ChangeRecord),
    /// The call was made in a non-syncing context.
    Skipped,
    /// The record could not be stored; synchronization is degraded.
    Degraded(CaptureWarning),
}

impl CaptureOutcome {
    /// The captured record, if any.
    pub fn record(&self) -> Option<&ChangeRecord> {
        match self {
            CaptureOutcome::Captured(record) => Some(record),
            _ => None,
        }
    }
}

/// A capture that did not reach the change store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureWarning {
    /// Entity table.
    pub table: String,
    /// Record identifier.
    pub global_id: GlobalId,
    /// Mutation that was lost.
    pub operation: Operation,
    /// What went wrong.
    pub message: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Mutation hooks for a syncable entity type.
///
/// The provided methods are what every entity type needs; implement the
/// trait with an empty body to opt in.
pub trait SyncHooks: SyncableEntity {
    /// Called after the entity was inserted.
    fn on_created(&self, capture: &ChangeCapture, ctx: CaptureContext) -> CaptureOutcome {
        capture.record(self, Operation::Create, ctx)
    }

    /// Called after the entity was modified.
    fn on_updated(&self, capture: &ChangeCapture, ctx: CaptureContext) -> CaptureOutcome {
        capture.record(self, Operation::Update, ctx)
    }

    /// Called after the entity was removed.
    fn on_deleted(&self, capture: &ChangeCapture, ctx: CaptureContext) -> CaptureOutcome {
        capture.record(self, Operation::Delete, ctx)
    }
}

/// Appends captured mutations to the change store.
pub struct ChangeCapture {
    site: SiteId,
    store: Arc<dyn ChangeStore>,
    warnings: Mutex<VecDeque<CaptureWarning>>,
    failures: AtomicU64,
}

impl ChangeCapture {
    /// Creates a capture for the given home site.
    pub fn new(site: SiteId, store: Arc<dyn ChangeStore>) -> Self {
        Self {
            site,
            store,
            warnings: Mutex::new(VecDeque::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Captures one mutation of `entity`.
    pub fn record<E: SyncableEntity + ?Sized>(
        &self,
        entity: &E,
        operation: Operation,
        ctx: CaptureContext,
    ) -> CaptureOutcome {
        let payload = operation.carries_payload().then(|| entity.snapshot());
        self.capture(
            entity.table(),
            entity.global_id(),
            entity.local_id(),
            operation,
            payload,
            ctx,
        )
    }

    /// Captures a mutation described field by field.
    pub fn capture(
        &self,
        table: &str,
        global_id: GlobalId,
        local_id: Option<i64>,
        operation: Operation,
        payload: Option<Snapshot>,
        ctx: CaptureContext,
    ) -> CaptureOutcome {
        if ctx == CaptureContext::NonSyncing {
            debug!(table, %global_id, "capture skipped in non-syncing context");
            return CaptureOutcome::Skipped;
        }

        let now = Utc::now();
        if table.trim().is_empty() {
            return self.degrade(table, global_id, operation, "empty table name".into(), now);
        }

        let record = ChangeRecord::captured(self.site, table, global_id, operation, payload, now)
            .with_local_id(local_id);
        match self.store.append(record) {
            Ok(stored) => {
                debug!(
                    table,
                    %global_id,
                    sequence = stored.sequence,
                    operation = %operation,
                    "change captured"
                );
                CaptureOutcome::Captured(stored)
            }
            Err(e) => self.degrade(table, global_id, operation, e.to_string(), now),
        }
    }

    fn degrade(
        &self,
        table: &str,
        global_id: GlobalId,
        operation: Operation,
        message: String,
        at: DateTime<Utc>,
    ) -> CaptureOutcome {
        error!(
            site = %self.site,
            table,
            %global_id,
            operation = %operation,
            error = %message,
            "change capture failed; sync is degraded"
        );
        let warning = CaptureWarning {
            table: table.to_string(),
            global_id,
            operation,
            message,
            at,
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut warnings = self.warnings.lock();
        if warnings.len() == MAX_CAPTURE_WARNINGS {
            warnings.pop_front();
        }
        warnings.push_back(warning.clone());
        CaptureOutcome::Degraded(warning)
    }

    /// Home site records are captured for.
    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Most recent capture warnings, oldest first.
    pub fn warnings(&self) -> Vec<CaptureWarning> {
        self.warnings.lock().iter().cloned().collect()
    }

    /// Total capture failures since start.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChangeCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCapture")
            .field("site", &self.site)
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, CoreResult};
    use crate::store::{ChangePage, ChangeQuery, MemoryChangeStore, StatusCounts};
    use sedesync_protocol::{ConflictId, RecordStatus};

    struct Appointment {
        id: GlobalId,
        site: SiteId,
        slot: &'static str,
    }

    impl SyncableEntity for Appointment {
        fn table(&self) -> &str {
            "appointments"
        }
        fn global_id(&self) -> GlobalId {
            self.id
        }
        fn site_id(&self) -> SiteId {
            self.site
        }
        fn local_id(&self) -> Option<i64> {
            Some(31)
        }
        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with("slot", self.slot)
        }
    }

    impl SyncHooks for Appointment {}

    /// A store whose disk is full.
    struct FullDisk;

    impl ChangeStore for FullDisk {
        fn append(&self, _: ChangeRecord) -> CoreResult<ChangeRecord> {
            Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }
        fn get(&self, _: u64) -> CoreResult<Option<ChangeRecord>> {
            Ok(None)
        }
        fn pending_for_site(&self, _: SiteId, _: usize) -> CoreResult<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }
        fn with_status(&self, _: SiteId, _: RecordStatus) -> CoreResult<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }
        fn history_for(&self, _: &str, _: GlobalId) -> CoreResult<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }
        fn flagged_with(&self, _: ConflictId) -> CoreResult<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }
        fn transition(
            &self,
            sequence: u64,
            _: RecordStatus,
            _: RecordStatus,
            _: Option<String>,
        ) -> CoreResult<ChangeRecord> {
            Err(CoreError::RecordNotFound { sequence })
        }
        fn flag(&self, sequence: u64, _: ConflictId) -> CoreResult<ChangeRecord> {
            Err(CoreError::RecordNotFound { sequence })
        }
        fn requeue_failed(&self, _: SiteId) -> CoreResult<Vec<u64>> {
            Ok(Vec::new())
        }
        fn changes_since(&self, query: &ChangeQuery) -> CoreResult<ChangePage> {
            Ok(ChangePage {
                records: Vec::new(),
                new_cursor: query.since,
                has_more: false,
            })
        }
        fn purge_synced_before(&self, _: DateTime<Utc>) -> CoreResult<usize> {
            Ok(0)
        }
        fn counts(&self, _: SiteId) -> CoreResult<StatusCounts> {
            Ok(StatusCounts::default())
        }
        fn head(&self) -> CoreResult<u64> {
            Ok(0)
        }
        fn load_cursor(&self, _: SiteId) -> CoreResult<u64> {
            Ok(0)
        }
        fn save_cursor(&self, _: SiteId, _: u64) -> CoreResult<()> {
            Ok(())
        }
        fn records(&self, _: Option<RecordStatus>, _: usize) -> CoreResult<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }
    }

    fn appointment(site: SiteId) -> Appointment {
        Appointment {
            id: GlobalId::new(),
            site,
            slot: "09:30",
        }
    }

    #[test]
    fn hooks_append_pending_records() {
        let site = SiteId::new();
        let store = Arc::new(MemoryChangeStore::new());
        let capture = ChangeCapture::new(site, store.clone());
        let appt = appointment(site);

        let created = appt.on_created(&capture, CaptureContext::Syncing);
        let record = created.record().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.local_id, Some(31));
        assert_eq!(record.payload, Some(appt.snapshot()));

        let deleted = appt.on_deleted(&capture, CaptureContext::Syncing);
        assert!(deleted.record().unwrap().payload.is_none());
        assert_eq!(store.counts(site).unwrap().pending, 2);
    }

    #[test]
    fn non_syncing_context_is_skipped() {
        let site = SiteId::new();
        let store = Arc::new(MemoryChangeStore::new());
        let capture = ChangeCapture::new(site, store.clone());

        let outcome = appointment(site).on_updated(&capture, CaptureContext::NonSyncing);
        assert_eq!(outcome, CaptureOutcome::Skipped);
        assert_eq!(store.head().unwrap(), 0);
    }

    #[test]
    fn store_failure_degrades_instead_of_failing() {
        let site = SiteId::new();
        let capture = ChangeCapture::new(site, Arc::new(FullDisk));

        let outcome = appointment(site).on_created(&capture, CaptureContext::Syncing);
        let CaptureOutcome::Degraded(warning) = outcome else {
            panic!("expected a degraded capture");
        };
        assert!(warning.message.contains("no space left"));
        assert_eq!(capture.failure_count(), 1);
        assert_eq!(capture.warnings(), vec![warning]);
    }

    #[test]
    fn warning_list_is_bounded() {
        let site = SiteId::new();
        let capture = ChangeCapture::new(site, Arc::new(FullDisk));
        for _ in 0..MAX_CAPTURE_WARNINGS + 10 {
            appointment(site).on_created(&capture, CaptureContext::Syncing);
        }
        assert_eq!(capture.warnings().len(), MAX_CAPTURE_WARNINGS);
        assert_eq!(capture.failure_count(), (MAX_CAPTURE_WARNINGS + 10) as u64);
    }
}
