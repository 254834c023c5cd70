//! Local entity storage and the applied-change ledger.
//!
//! The entity store keeps the current state of every syncable record as a
//! generic row (table, global id, snapshot). A deleted record stays as a
//! tombstone so later UPDATEs can be told apart from UPDATEs to records
//! that were never seen.
//!
//! Each write may carry ledger marks. A mark records that a change with a
//! given origin key has been applied and what its fingerprint was; row and
//! marks are committed together so a crash never leaves one without the
//! other.

use crate::error::CoreResult;
use crate::journal::Journal;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sedesync_protocol::{Fingerprint, GlobalId, OriginKey, SiteId, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::info;

/// Current state of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Entity table.
    pub table: String,
    /// Record identifier.
    pub global_id: GlobalId,
    /// Owning site.
    pub site_id: SiteId,
    /// Local id at the owning site.
    pub local_id: Option<i64>,
    /// Current fields; `None` once deleted.
    pub payload: Option<Snapshot>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl EntityRow {
    /// Returns true unless the row is a tombstone.
    pub fn is_live(&self) -> bool {
        self.payload.is_some()
    }
}

/// Ledger entry for an applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMark {
    /// Idempotence key of the change.
    pub origin: OriginKey,
    /// Record the change touched.
    pub global_id: GlobalId,
    /// Content digest of the change.
    pub fingerprint: Fingerprint,
}

/// One atomic entity store write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    /// New row state, if the row changes.
    pub row: Option<EntityRow>,
    /// Ledger marks committed with the row.
    pub marks: Vec<AppliedMark>,
}

impl EntityWrite {
    /// A write that only changes a row.
    pub fn row(row: EntityRow) -> Self {
        Self {
            row: Some(row),
            marks: Vec::new(),
        }
    }

    /// Adds a ledger mark.
    #[must_use]
    pub fn with_mark(mut self, mark: AppliedMark) -> Self {
        self.marks.push(mark);
        self
    }
}

/// Storage for entity rows and the applied-change ledger.
pub trait EntityStore: Send + Sync {
    /// Returns a row, live or tombstoned.
    fn get(&self, table: &str, global_id: GlobalId) -> CoreResult<Option<EntityRow>>;

    /// Commits a row change and its ledger marks atomically.
    fn commit(&self, write: EntityWrite) -> CoreResult<()>;

    /// Fingerprint recorded for an origin key, if that change was applied.
    fn applied(&self, key: &OriginKey) -> CoreResult<Option<Fingerprint>>;

    /// Highest origin sequence applied from `origin` for a record.
    fn last_applied(&self, origin: SiteId, global_id: GlobalId) -> CoreResult<Option<u64>>;

    /// Every row of a table, tombstones included, ordered by global id.
    fn rows(&self, table: &str) -> CoreResult<Vec<EntityRow>>;

    /// Names of every table with at least one row.
    fn tables(&self) -> CoreResult<Vec<String>>;

    /// Rewrites durable state without superseded writes.
    fn compact(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct EntityState {
    rows: BTreeMap<(String, GlobalId), EntityRow>,
    ledger: BTreeMap<OriginKey, AppliedMark>,
    high_water: HashMap<(SiteId, GlobalId), u64>,
}

impl EntityState {
    fn from_writes(writes: Vec<EntityWrite>) -> Self {
        let mut state = Self::default();
        for write in &writes {
            state.apply(write);
        }
        state
    }

    fn apply(&mut self, write: &EntityWrite) {
        if let Some(row) = &write.row {
            self.rows
                .insert((row.table.clone(), row.global_id), row.clone());
        }
        for mark in &write.marks {
            self.ledger.insert(mark.origin, mark.clone());
            let high = self
                .high_water
                .entry((mark.origin.site, mark.global_id))
                .or_insert(0);
            *high = (*high).max(mark.origin.sequence);
        }
    }

    /// Minimal write sequence reproducing this state.
    fn snapshot_writes(&self) -> Vec<EntityWrite> {
        let mut writes: Vec<EntityWrite> =
            self.rows.values().cloned().map(EntityWrite::row).collect();
        let marks = self.ledger.values().cloned().collect();
        writes.push(EntityWrite { row: None, marks });
        writes
    }
}

/// Rows plus an optional journal behind one lock.
struct EntityCore {
    state: RwLock<EntityState>,
    journal: Option<Mutex<Journal>>,
}

impl EntityCore {
    fn get(&self, table: &str, global_id: GlobalId) -> Option<EntityRow> {
        self.state
            .read()
            .rows
            .get(&(table.to_string(), global_id))
            .cloned()
    }

    fn commit(&self, write: EntityWrite) -> CoreResult<()> {
        let mut state = self.state.write();
        if let Some(journal) = &self.journal {
            journal.lock().append(&write)?;
        }
        state.apply(&write);
        Ok(())
    }

    fn applied(&self, key: &OriginKey) -> Option<Fingerprint> {
        self.state.read().ledger.get(key).map(|mark| mark.fingerprint)
    }

    fn last_applied(&self, origin: SiteId, global_id: GlobalId) -> Option<u64> {
        self.state
            .read()
            .high_water
            .get(&(origin, global_id))
            .copied()
    }

    fn rows(&self, table: &str) -> Vec<EntityRow> {
        self.state
            .read()
            .rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    fn tables(&self) -> Vec<String> {
        let state = self.state.read();
        let names: BTreeSet<&String> = state.rows.keys().map(|(t, _)| t).collect();
        names.into_iter().cloned().collect()
    }

    fn compact(&self) -> CoreResult<()> {
        let state = self.state.write();
        if let Some(journal) = &self.journal {
            journal.lock().rewrite(&state.snapshot_writes())?;
        }
        Ok(())
    }
}

macro_rules! entity_store_impl {
    ($ty:ty) => {
        impl EntityStore for $ty {
            fn get(&self, table: &str, global_id: GlobalId) -> CoreResult<Option<EntityRow>> {
                Ok(self.core.get(table, global_id))
            }

            fn commit(&self, write: EntityWrite) -> CoreResult<()> {
                self.core.commit(write)
            }

            fn applied(&self, key: &OriginKey) -> CoreResult<Option<Fingerprint>> {
                Ok(self.core.applied(key))
            }

            fn last_applied(
                &self,
                origin: SiteId,
                global_id: GlobalId,
            ) -> CoreResult<Option<u64>> {
                Ok(self.core.last_applied(origin, global_id))
            }

            fn rows(&self, table: &str) -> CoreResult<Vec<EntityRow>> {
                Ok(self.core.rows(table))
            }

            fn tables(&self) -> CoreResult<Vec<String>> {
                Ok(self.core.tables())
            }

            fn compact(&self) -> CoreResult<()> {
                self.core.compact()
            }
        }
    };
}

/// Entity store kept in memory.
pub struct MemoryEntityStore {
    core: EntityCore,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            core: EntityCore {
                state: RwLock::new(EntityState::default()),
                journal: None,
            },
        }
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

entity_store_impl!(MemoryEntityStore);

/// Entity store persisted as a journal of writes.
pub struct FileEntityStore {
    core: EntityCore,
}

impl FileEntityStore {
    /// Opens or creates the store at `path`, replaying its journal.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let (journal, writes) = Journal::open::<EntityWrite>(path)?;
        let state = EntityState::from_writes(writes);
        info!(
            path = %path.display(),
            rows = state.rows.len(),
            applied = state.ledger.len(),
            "entity store opened"
        );
        Ok(Self {
            core: EntityCore {
                state: RwLock::new(state),
                journal: Some(Mutex::new(journal)),
            },
        })
    }
}

entity_store_impl!(FileEntityStore);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(table: &str, gid: GlobalId, site: SiteId, payload: Option<Snapshot>) -> EntityRow {
        EntityRow {
            table: table.into(),
            global_id: gid,
            site_id: site,
            local_id: None,
            payload,
            updated_at: Utc::now(),
        }
    }

    fn mark(site: SiteId, sequence: u64, gid: GlobalId, byte: u8) -> AppliedMark {
        AppliedMark {
            origin: OriginKey { site, sequence },
            global_id: gid,
            fingerprint: Fingerprint([byte; 32]),
        }
    }

    #[test]
    fn rows_and_marks_commit_together() {
        let store = MemoryEntityStore::new();
        let site = SiteId::new();
        let gid = GlobalId::new();

        store
            .commit(
                EntityWrite::row(row("patients", gid, site, Some(Snapshot::new().with("n", 1i64))))
                    .with_mark(mark(site, 3, gid, 7)),
            )
            .unwrap();

        assert!(store.get("patients", gid).unwrap().unwrap().is_live());
        assert_eq!(
            store.applied(&OriginKey { site, sequence: 3 }).unwrap(),
            Some(Fingerprint([7; 32]))
        );
        assert_eq!(store.last_applied(site, gid).unwrap(), Some(3));
        assert_eq!(store.last_applied(SiteId::new(), gid).unwrap(), None);
    }

    #[test]
    fn tombstones_are_kept() {
        let store = MemoryEntityStore::new();
        let site = SiteId::new();
        let gid = GlobalId::new();
        store
            .commit(EntityWrite::row(row("invoices", gid, site, Some(Snapshot::new()))))
            .unwrap();
        store
            .commit(EntityWrite::row(row("invoices", gid, site, None)))
            .unwrap();

        let stored = store.get("invoices", gid).unwrap().unwrap();
        assert!(!stored.is_live());
        assert_eq!(store.rows("invoices").unwrap().len(), 1);
        assert_eq!(store.tables().unwrap(), vec!["invoices".to_string()]);
    }

    #[test]
    fn high_water_only_rises() {
        let store = MemoryEntityStore::new();
        let site = SiteId::new();
        let gid = GlobalId::new();
        for seq in [5, 2, 9] {
            store
                .commit(EntityWrite::default().with_mark(mark(site, seq, gid, seq as u8)))
                .unwrap();
        }
        assert_eq!(store.last_applied(site, gid).unwrap(), Some(9));
    }

    #[test]
    fn file_store_replays_and_compacts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.log");
        let site = SiteId::new();
        let gid = GlobalId::new();

        {
            let store = FileEntityStore::open(&path).unwrap();
            for n in 0..5i64 {
                store
                    .commit(
                        EntityWrite::row(row(
                            "patients",
                            gid,
                            site,
                            Some(Snapshot::new().with("visits", n)),
                        ))
                        .with_mark(mark(site, n as u64 + 1, gid, n as u8)),
                    )
                    .unwrap();
            }
            store.compact().unwrap();
        }

        let store = FileEntityStore::open(&path).unwrap();
        let stored = store.get("patients", gid).unwrap().unwrap();
        assert_eq!(stored.payload, Some(Snapshot::new().with("visits", 4i64)));
        assert_eq!(store.last_applied(site, gid).unwrap(), Some(5));
        assert_eq!(
            store.applied(&OriginKey { site, sequence: 1 }).unwrap(),
            Some(Fingerprint([0; 32]))
        );
    }
}
