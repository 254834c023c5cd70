//! Apply engine.
//!
//! Applies incoming change records to the local entity store, exactly
//! once per origin key, or parks them in the conflict registry when they
//! compete with a change the sender has not seen.
//!
//! # Decision order
//!
//! For each incoming record:
//!
//! 1. Structural validation (table, payload presence, origin sequence)
//! 2. Echo of this node's own change: duplicate
//! 3. Ledger lookup by origin key: duplicate or fingerprint mismatch
//! 4. Origin ordering per record
//! 5. Earlier failure for the same record in this batch
//! 6. Open conflict for the record: hold
//! 7. Resolution of a conflict this node is flagged behind: authoritative
//! 8. Competing changes: agree, hold, or open a conflict
//! 9. Entity state checks (unknown, deleted, already exists)
//! 10. Commit the row with its ledger mark, then append a SYNCED replica
//!
//! Batches are serialized on one lock so concurrent callers cannot
//! interleave steps 3 to 10 for the same record.

use crate::entity::{AppliedMark, EntityRow, EntityStore, EntityWrite};
use crate::error::CoreResult;
use crate::registry::ConflictRegistry;
use crate::store::ChangeStore;
use chrono::Utc;
use parking_lot::Mutex;
use sedesync_protocol::{
    ApplyOutcome, ChangeRecord, ConflictEntry, ConflictId, Direction, GlobalId, Operation,
    ProtocolError, RecordStatus, RejectReason, SiteId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an incoming batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    /// Site that sent the batch.
    pub origin: SiteId,
    /// The sender's pull watermark on this node, for pushes.
    pub expected_cursor: Option<u64>,
    /// How the batch arrived.
    pub direction: Direction,
}

impl ApplyContext {
    /// Context for a batch pushed to this node.
    pub fn push(origin: SiteId, expected_cursor: Option<u64>) -> Self {
        Self {
            origin,
            expected_cursor,
            direction: Direction::Push,
        }
    }

    /// Context for a page pulled by this node.
    pub fn pull(origin: SiteId) -> Self {
        Self {
            origin,
            expected_cursor: None,
            direction: Direction::Pull,
        }
    }
}

/// Applies incoming records for one home site.
pub struct ApplyEngine {
    pub(crate) home: SiteId,
    pub(crate) changes: Arc<dyn ChangeStore>,
    pub(crate) entities: Arc<dyn EntityStore>,
    pub(crate) conflicts: Arc<ConflictRegistry>,
    pub(crate) lock: Mutex<()>,
}

impl ApplyEngine {
    /// Creates an engine over the node's stores.
    pub fn new(
        home: SiteId,
        changes: Arc<dyn ChangeStore>,
        entities: Arc<dyn EntityStore>,
        conflicts: Arc<ConflictRegistry>,
    ) -> Self {
        Self {
            home,
            changes,
            entities,
            conflicts,
            lock: Mutex::new(()),
        }
    }

    /// Applies one record.
    pub fn apply(&self, ctx: &ApplyContext, record: &ChangeRecord) -> CoreResult<ApplyOutcome> {
        let mut outcomes = self.apply_batch(ctx, std::slice::from_ref(record))?;
        Ok(outcomes.pop().unwrap_or_else(ApplyOutcome::applied))
    }

    /// Applies records in order, one outcome per record.
    ///
    /// Per-record failures are outcomes; only storage errors abort.
    pub fn apply_batch(
        &self,
        ctx: &ApplyContext,
        records: &[ChangeRecord],
    ) -> CoreResult<Vec<ApplyOutcome>> {
        let _guard = self.lock.lock();
        let mut failed: HashSet<(String, GlobalId)> = HashSet::new();
        let mut outcomes = Vec::with_capacity(records.len());
        let (mut applied, mut conflicts, mut rejected) = (0usize, 0usize, 0usize);

        for record in records {
            let outcome = self.apply_one(ctx, record, &failed)?;
            match &outcome {
                ApplyOutcome::Applied { .. } => applied += 1,
                ApplyOutcome::Conflict { .. } => conflicts += 1,
                ApplyOutcome::Rejected { reason } => {
                    rejected += 1;
                    failed.insert((record.table.clone(), record.global_id));
                    warn!(
                        origin = %record.site_id,
                        sequence = record.origin_sequence,
                        table = %record.table,
                        global_id = %record.global_id,
                        %reason,
                        "change rejected"
                    );
                }
            }
            outcomes.push(outcome);
        }

        if !records.is_empty() {
            info!(
                home = %self.home,
                from = %ctx.origin,
                direction = %ctx.direction,
                applied,
                conflicts,
                rejected,
                "batch applied"
            );
        }
        Ok(outcomes)
    }

    fn apply_one(
        &self,
        ctx: &ApplyContext,
        record: &ChangeRecord,
        failed: &HashSet<(String, GlobalId)>,
    ) -> CoreResult<ApplyOutcome> {
        if let Err(e) = record.validate() {
            let detail = match e {
                ProtocolError::Malformed(detail) => detail,
                other => other.to_string(),
            };
            return Ok(ApplyOutcome::rejected(RejectReason::Malformed(detail)));
        }

        if record.site_id == self.home {
            return Ok(ApplyOutcome::Applied { duplicate: true });
        }

        let key = record.origin_key();
        match self.entities.applied(&key)? {
            Some(fingerprint) if fingerprint == record.fingerprint() => {
                debug!(origin = %key, "duplicate change ignored");
                return Ok(ApplyOutcome::Applied { duplicate: true });
            }
            Some(_) => return Ok(ApplyOutcome::rejected(RejectReason::FingerprintMismatch)),
            None => {}
        }

        if let Some(applied) = self.entities.last_applied(record.site_id, record.global_id)? {
            if record.origin_sequence < applied {
                return Ok(ApplyOutcome::rejected(RejectReason::OutOfOrder {
                    applied,
                    incoming: record.origin_sequence,
                }));
            }
        }

        if failed.contains(&(record.table.clone(), record.global_id)) {
            return Ok(ApplyOutcome::rejected(RejectReason::BlockedByEarlierFailure));
        }

        if let Some(id) = self.conflicts.open_for(&record.table, record.global_id) {
            return self.hold(id, record);
        }

        let history = self.changes.history_for(&record.table, record.global_id)?;

        if let Some(resolves) = record.resolves {
            let superseded: Vec<&ChangeRecord> = history
                .iter()
                .filter(|r| r.conflict == Some(resolves))
                .collect();
            if !superseded.is_empty() {
                self.commit(record)?;
                for local in superseded {
                    self.changes.transition(
                        local.sequence,
                        RecordStatus::Pending,
                        RecordStatus::Synced,
                        None,
                    )?;
                }
                info!(
                    conflict = %resolves,
                    global_id = %record.global_id,
                    "resolution applied; local changes superseded"
                );
                return Ok(ApplyOutcome::applied());
            }
        }

        let mut competing: Vec<&ChangeRecord> = history
            .iter()
            .filter(|r| r.site_id == self.home && r.is_unsynced())
            .collect();
        if let Some(cursor) = ctx.expected_cursor {
            competing.extend(history.iter().filter(|r| {
                r.status == RecordStatus::Synced
                    && r.sequence > cursor
                    && r.site_id != record.site_id
            }));
        }
        competing.sort_by_key(|r| r.sequence);

        if let Some(flag) = competing.iter().find_map(|r| r.conflict) {
            return self.hold(flag, record);
        }
        if let Some(latest) = competing.last() {
            if !latest.agrees_with(record) {
                let id = self.open_conflict(ctx, latest, record, &history)?;
                return Ok(ApplyOutcome::Conflict {
                    conflict_id: id,
                    opened: true,
                });
            }
        }

        let row = self.entities.get(&record.table, record.global_id)?;
        let live = row.as_ref().is_some_and(EntityRow::is_live);
        let rejection = match (record.operation, &row) {
            (Operation::Create, Some(existing)) if live && existing.payload != record.payload => {
                Some(RejectReason::AlreadyExists)
            }
            (Operation::Update | Operation::Delete, None) => Some(RejectReason::UnknownRecord),
            (Operation::Update, Some(_)) if !live => Some(RejectReason::AlreadyDeleted),
            _ => None,
        };
        if let Some(reason) = rejection {
            return Ok(ApplyOutcome::rejected(reason));
        }

        self.commit(record)?;
        debug!(
            origin = %key,
            table = %record.table,
            global_id = %record.global_id,
            operation = %record.operation,
            "change applied"
        );
        Ok(ApplyOutcome::applied())
    }

    /// Parks a record behind an existing conflict.
    ///
    /// Conflicts opened by a peer are not in this registry; such records
    /// are left for the resolution to supersede.
    fn hold(&self, id: ConflictId, record: &ChangeRecord) -> CoreResult<ApplyOutcome> {
        if self.conflicts.get(id).is_some() {
            self.conflicts.hold(id, record.clone())?;
        }
        debug!(conflict = %id, global_id = %record.global_id, "change held behind conflict");
        Ok(ApplyOutcome::Conflict {
            conflict_id: id,
            opened: false,
        })
    }

    /// Keeps a later local change behind the conflict open for its record.
    ///
    /// The entry's local side moves to the newer change, so the operator
    /// decides against the current local state and the resolution covers
    /// every flagged record. Returns `None` when nothing is open here.
    pub fn hold_local(&self, record: &ChangeRecord) -> CoreResult<Option<ConflictId>> {
        let _guard = self.lock.lock();
        let Some(id) = self.conflicts.open_for(&record.table, record.global_id) else {
            return Ok(None);
        };
        let flagged = self.changes.flag(record.sequence, id)?;
        self.conflicts.replace_local(id, flagged)?;
        debug!(conflict = %id, global_id = %record.global_id, "local change held behind conflict");
        Ok(Some(id))
    }

    fn open_conflict(
        &self,
        ctx: &ApplyContext,
        local: &ChangeRecord,
        remote: &ChangeRecord,
        history: &[ChangeRecord],
    ) -> CoreResult<ConflictId> {
        let entry = ConflictEntry {
            id: ConflictId::new(),
            home_site: self.home,
            table: remote.table.clone(),
            global_id: remote.global_id,
            local: local.clone(),
            remote: remote.clone(),
            held: Vec::new(),
            detected_on: ctx.direction,
            detected_at: Utc::now(),
        };
        let id = entry.id;
        self.conflicts.open_entry(entry)?;
        for own in history
            .iter()
            .filter(|r| r.site_id == self.home && r.status == RecordStatus::Pending)
        {
            self.changes.flag(own.sequence, id)?;
        }
        Ok(id)
    }

    /// Writes the row and ledger mark, then keeps a SYNCED replica.
    fn commit(&self, record: &ChangeRecord) -> CoreResult<()> {
        let now = Utc::now();
        let existing = self.entities.get(&record.table, record.global_id)?;
        let row = EntityRow {
            table: record.table.clone(),
            global_id: record.global_id,
            site_id: existing.as_ref().map_or(record.site_id, |r| r.site_id),
            local_id: existing
                .as_ref()
                .and_then(|r| r.local_id)
                .or(record.local_id),
            payload: match record.operation {
                Operation::Delete => None,
                Operation::Create | Operation::Update => record.payload.clone(),
            },
            updated_at: now,
        };
        let mark = AppliedMark {
            origin: record.origin_key(),
            global_id: record.global_id,
            fingerprint: record.fingerprint(),
        };
        self.entities.commit(EntityWrite::row(row).with_mark(mark))?;
        self.changes.append(record.replica(now))?;
        Ok(())
    }
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}
