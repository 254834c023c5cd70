//! The ChangeRecord store (outbox).
//!
//! The store is an ordered log of change records indexed by
//! (site, status) and by (table, global id), plus the pull watermark this
//! node keeps for each peer. Every status change is a single
//! compare-and-set on one record.

mod file;
mod changelog;
mod memory;

pub use file::FileChangeStore;
pub use memory::MemoryChangeStore;

use crate::error::CoreResult;
use crate::journal::Journal;
use chrono::{DateTime, Utc};
use changelog::{ChangeEvent, ChangeLog};
use parking_lot::RwLock;
use sedesync_protocol::{ChangeRecord, ConflictId, GlobalId, RecordStatus, SiteId};
use serde::Serialize;

/// Selection of records for a pull page.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    /// Return records strictly above this sequence.
    pub since: u64,
    /// Restrict to these tables.
    pub tables: Option<Vec<String>>,
    /// Skip records that originated at this site.
    pub exclude_origin: Option<SiteId>,
    /// Page size.
    pub limit: usize,
}

/// One page of SYNCED records.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    /// Records in sequence order.
    pub records: Vec<ChangeRecord>,
    /// Highest sequence covered by this page.
    pub new_cursor: u64,
    /// Whether more matching records follow.
    pub has_more: bool,
}

/// Per-site record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// PENDING records owned by the site.
    pub pending: usize,
    /// SYNCED records owned by the site.
    pub synced: usize,
    /// FAILED records owned by the site.
    pub failed: usize,
    /// PENDING records held behind a conflict.
    pub flagged: usize,
    /// Replicas of other sites' records.
    pub replicas: usize,
}

/// Durable ordered log of change records.
pub trait ChangeStore: Send + Sync {
    /// Appends a record, assigning the next sequence.
    ///
    /// A record whose `origin_sequence` is zero was captured here and gets
    /// its own sequence as origin sequence.
    fn append(&self, record: ChangeRecord) -> CoreResult<ChangeRecord>;

    /// Returns a record by sequence.
    fn get(&self, sequence: u64) -> CoreResult<Option<ChangeRecord>>;

    /// PENDING records owned by `site` that are not held behind a
    /// conflict, in sequence order.
    fn pending_for_site(&self, site: SiteId, limit: usize) -> CoreResult<Vec<ChangeRecord>>;

    /// Records owned by `site` with the given status, in sequence order.
    fn with_status(&self, site: SiteId, status: RecordStatus) -> CoreResult<Vec<ChangeRecord>>;

    /// Every record for one entity, in sequence order.
    fn history_for(&self, table: &str, global_id: GlobalId) -> CoreResult<Vec<ChangeRecord>>;

    /// Records held behind the given conflict.
    fn flagged_with(&self, conflict: ConflictId) -> CoreResult<Vec<ChangeRecord>>;

    /// Moves a record from `expected` to `next`.
    ///
    /// Fails with `StatusMismatch` if the record is no longer `expected`,
    /// and with an invalid transition error for illegal moves. Clears any
    /// conflict flag.
    fn transition(
        &self,
        sequence: u64,
        expected: RecordStatus,
        next: RecordStatus,
        error: Option<String>,
    ) -> CoreResult<ChangeRecord>;

    /// Holds a PENDING record behind a conflict.
    fn flag(&self, sequence: u64, conflict: ConflictId) -> CoreResult<ChangeRecord>;

    /// Moves every FAILED record of `site` back to PENDING.
    fn requeue_failed(&self, site: SiteId) -> CoreResult<Vec<u64>>;

    /// A page of SYNCED records for a peer.
    fn changes_since(&self, query: &ChangeQuery) -> CoreResult<ChangePage>;

    /// Deletes SYNCED records last updated before `cutoff`.
    fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize>;

    /// Counts for one site.
    fn counts(&self, site: SiteId) -> CoreResult<StatusCounts>;

    /// Highest sequence assigned so far.
    fn head(&self) -> CoreResult<u64>;

    /// Pull watermark for a peer, zero if never pulled.
    fn load_cursor(&self, peer: SiteId) -> CoreResult<u64>;

    /// Stores the pull watermark for a peer.
    fn save_cursor(&self, peer: SiteId, cursor: u64) -> CoreResult<()>;

    /// Records in sequence order, optionally filtered by status.
    fn records(&self, status: Option<RecordStatus>, limit: usize)
        -> CoreResult<Vec<ChangeRecord>>;
}

struct LogState {
    log: ChangeLog,
    journal: Option<Journal>,
}

/// Log plus optional journal behind one lock.
pub(crate) struct LogCore {
    state: RwLock<LogState>,
}

impl LogCore {
    pub(crate) fn new(log: ChangeLog, journal: Option<Journal>) -> Self {
        Self {
            state: RwLock::new(LogState { log, journal }),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&ChangeLog) -> R) -> R {
        f(&self.state.read().log)
    }

    /// Plans events against the current log, journals them, then applies them.
    fn commit<R>(
        &self,
        plan: impl FnOnce(&ChangeLog) -> CoreResult<(Vec<ChangeEvent>, R)>,
    ) -> CoreResult<R> {
        let mut state = self.state.write();
        let (events, result) = plan(&state.log)?;
        if let Some(journal) = state.journal.as_mut() {
            for event in &events {
                journal.append(event)?;
            }
        }
        for event in &events {
            state.log.apply(event);
        }
        Ok(result)
    }

    fn compact(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        let LogState { log, journal } = &mut *state;
        if let Some(journal) = journal.as_mut() {
            journal.rewrite(&log.snapshot_events())?;
        }
        Ok(())
    }

    pub(crate) fn append(&self, record: ChangeRecord) -> CoreResult<ChangeRecord> {
        self.commit(|log| {
            let record = log.plan_append(record);
            Ok((vec![ChangeEvent::Put(record.clone())], record))
        })
    }

    pub(crate) fn get(&self, sequence: u64) -> CoreResult<Option<ChangeRecord>> {
        Ok(self.read(|log| log.get(sequence).cloned()))
    }

    pub(crate) fn pending_for_site(
        &self,
        site: SiteId,
        limit: usize,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(self.read(|log| {
            log.with_status(site, RecordStatus::Pending)
                .filter(|r| !r.is_flagged())
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    pub(crate) fn with_status(
        &self,
        site: SiteId,
        status: RecordStatus,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(self.read(|log| log.with_status(site, status).cloned().collect()))
    }

    pub(crate) fn history_for(
        &self,
        table: &str,
        global_id: GlobalId,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(self.read(|log| log.history(table, global_id)))
    }

    pub(crate) fn flagged_with(&self, conflict: ConflictId) -> CoreResult<Vec<ChangeRecord>> {
        Ok(self.read(|log| log.flagged_with(conflict)))
    }

    pub(crate) fn transition(
        &self,
        sequence: u64,
        expected: RecordStatus,
        next: RecordStatus,
        error: Option<String>,
    ) -> CoreResult<ChangeRecord> {
        self.commit(|log| {
            let record = log.plan_transition(sequence, expected, next, error, Utc::now())?;
            Ok((vec![ChangeEvent::Put(record.clone())], record))
        })
    }

    pub(crate) fn flag(&self, sequence: u64, conflict: ConflictId) -> CoreResult<ChangeRecord> {
        self.commit(|log| {
            let record = log.plan_flag(sequence, conflict, Utc::now())?;
            Ok((vec![ChangeEvent::Put(record.clone())], record))
        })
    }

    pub(crate) fn requeue_failed(&self, site: SiteId) -> CoreResult<Vec<u64>> {
        self.commit(|log| {
            let records = log.plan_requeue(site, Utc::now());
            let sequences = records.iter().map(|r| r.sequence).collect();
            Ok((records.into_iter().map(ChangeEvent::Put).collect(), sequences))
        })
    }

    pub(crate) fn changes_since(&self, query: &ChangeQuery) -> CoreResult<ChangePage> {
        Ok(self.read(|log| log.page(query)))
    }

    pub(crate) fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let purged = self.commit(|log| {
            let expired = log.plan_purge(cutoff);
            let count = expired.len();
            let events = if expired.is_empty() {
                Vec::new()
            } else {
                vec![ChangeEvent::Purge(expired)]
            };
            Ok((events, count))
        })?;
        if purged > 0 {
            self.compact()?;
        }
        Ok(purged)
    }

    pub(crate) fn counts(&self, site: SiteId) -> CoreResult<StatusCounts> {
        Ok(self.read(|log| log.counts(site)))
    }

    pub(crate) fn head(&self) -> CoreResult<u64> {
        Ok(self.read(ChangeLog::head))
    }

    pub(crate) fn load_cursor(&self, peer: SiteId) -> CoreResult<u64> {
        Ok(self.read(|log| log.cursor(peer)))
    }

    pub(crate) fn save_cursor(&self, peer: SiteId, cursor: u64) -> CoreResult<()> {
        self.commit(|_| Ok((vec![ChangeEvent::Cursor { peer, cursor }], ())))
    }

    pub(crate) fn records(
        &self,
        status: Option<RecordStatus>,
        limit: usize,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(self.read(|log| {
            log.records()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .take(limit)
                .cloned()
                .collect()
        }))
    }
}

/// Implements `ChangeStore` for a type with a `core: LogCore` field.
macro_rules! forward_change_store {
    ($ty:ty) => {
        impl $crate::store::ChangeStore for $ty {
            fn append(
                &self,
                record: ::sedesync_protocol::ChangeRecord,
            ) -> $crate::error::CoreResult<::sedesync_protocol::ChangeRecord> {
                self.core.append(record)
            }
            fn get(
                &self,
                sequence: u64,
            ) -> $crate::error::CoreResult<Option<::sedesync_protocol::ChangeRecord>> {
                self.core.get(sequence)
            }
            fn pending_for_site(
                &self,
                site: ::sedesync_protocol::SiteId,
                limit: usize,
            ) -> $crate::error::CoreResult<Vec<::sedesync_protocol::ChangeRecord>> {
                self.core.pending_for_site(site, limit)
            }
            fn with_status(
                &self,
                site: ::sedesync_protocol::SiteId,
                status: ::sedesync_protocol::RecordStatus,
            ) -> $crate::error::CoreResult<Vec<::sedesync_protocol::ChangeRecord>> {
                self.core.with_status(site, status)
            }
            fn history_for(
                &self,
                table: &str,
                global_id: ::sedesync_protocol::GlobalId,
            ) -> $crate::error::CoreResult<Vec<::sedesync_protocol::ChangeRecord>> {
                self.core.history_for(table, global_id)
            }
            fn flagged_with(
                &self,
                conflict: ::sedesync_protocol::ConflictId,
            ) -> $crate::error::CoreResult<Vec<::sedesync_protocol::ChangeRecord>> {
                self.core.flagged_with(conflict)
            }
            fn transition(
                &self,
                sequence: u64,
                expected: ::sedesync_protocol::RecordStatus,
                next: ::sedesync_protocol::RecordStatus,
                error: Option<String>,
            ) -> $crate::error::CoreResult<::sedesync_protocol::ChangeRecord> {
                self.core.transition(sequence, expected, next, error)
            }
            fn flag(
                &self,
                sequence: u64,
                conflict: ::sedesync_protocol::ConflictId,
            ) -> $crate::error::CoreResult<::sedesync_protocol::ChangeRecord> {
                self.core.flag(sequence, conflict)
            }
            fn requeue_failed(
                &self,
                site: ::sedesync_protocol::SiteId,
            ) -> $crate::error::CoreResult<Vec<u64>> {
                self.core.requeue_failed(site)
            }
            fn changes_since(
                &self,
                query: &$crate::store::ChangeQuery,
            ) -> $crate::error::CoreResult<$crate::store::ChangePage> {
                self.core.changes_since(query)
            }
            fn purge_synced_before(
                &self,
                cutoff: ::chrono::DateTime<::chrono::Utc>,
            ) -> $crate::error::CoreResult<usize> {
                self.core.purge_synced_before(cutoff)
            }
            fn counts(
                &self,
                site: ::sedesync_protocol::SiteId,
            ) -> $crate::error::CoreResult<$crate::store::StatusCounts> {
                self.core.counts(site)
            }
            fn head(&self) -> $crate::error::CoreResult<u64> {
                self.core.head()
            }
            fn load_cursor(
                &self,
                peer: ::sedesync_protocol::SiteId,
            ) -> $crate::error::CoreResult<u64> {
                self.core.load_cursor(peer)
            }
            fn save_cursor(
                &self,
                peer: ::sedesync_protocol::SiteId,
                cursor: u64,
            ) -> $crate::error::CoreResult<()> {
                self.core.save_cursor(peer, cursor)
            }
            fn records(
                &self,
                status: Option<::sedesync_protocol::RecordStatus>,
                limit: usize,
            ) -> $crate::error::CoreResult<Vec<::sedesync_protocol::ChangeRecord>> {
                self.core.records(status, limit)
            }
        }
    };
}
pub(crate) use forward_change_store;
