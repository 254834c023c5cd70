//! Conflict registry.
//!
//! Holds every open conflict of a node until an operator resolves it.
//! At most one entry is open per (table, global id); changes that arrive
//! for that record while it is open are appended to the entry's held list.
//! Later local changes replace the entry's local side.

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use parking_lot::{Mutex, RwLock};
use sedesync_protocol::{ChangeRecord, ConflictEntry, ConflictId, GlobalId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RegistryEvent {
    Opened(ConflictEntry),
    Held { id: ConflictId, record: ChangeRecord },
    LocalEdit { id: ConflictId, record: ChangeRecord },
    Closed(ConflictId),
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<ConflictId, ConflictEntry>,
    by_record: HashMap<(String, GlobalId), ConflictId>,
}

impl Entries {
    fn apply(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Opened(entry) => {
                self.by_record
                    .insert((entry.table.clone(), entry.global_id), entry.id);
                self.by_id.insert(entry.id, entry);
            }
            RegistryEvent::Held { id, record } => {
                if let Some(entry) = self.by_id.get_mut(&id) {
                    entry.held.push(record);
                }
            }
            RegistryEvent::LocalEdit { id, record } => {
                if let Some(entry) = self.by_id.get_mut(&id) {
                    entry.local = record;
                }
            }
            RegistryEvent::Closed(id) => {
                if let Some(entry) = self.by_id.remove(&id) {
                    self.by_record.remove(&(entry.table, entry.global_id));
                }
            }
        }
    }
}

/// Open conflicts awaiting an operator decision.
pub struct ConflictRegistry {
    entries: RwLock<Entries>,
    journal: Option<Mutex<Journal>>,
}

impl ConflictRegistry {
    /// Creates an empty registry kept in memory.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            journal: None,
        }
    }

    /// Opens or creates a journaled registry at `path`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let (journal, events) = Journal::open::<RegistryEvent>(path)?;
        let mut entries = Entries::default();
        for event in events {
            entries.apply(event);
        }
        if !entries.by_id.is_empty() {
            info!(open = entries.by_id.len(), "conflict registry has open entries");
        }
        Ok(Self {
            entries: RwLock::new(entries),
            journal: Some(Mutex::new(journal)),
        })
    }

    fn commit(&self, entries: &mut Entries, event: RegistryEvent) -> CoreResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().append(&event)?;
        }
        entries.apply(event);
        Ok(())
    }

    /// Registers a new conflict.
    ///
    /// Fails if a conflict is already open for the same record.
    pub fn open_entry(&self, entry: ConflictEntry) -> CoreResult<()> {
        let mut entries = self.entries.write();
        let key = (entry.table.clone(), entry.global_id);
        if let Some(existing) = entries.by_record.get(&key) {
            return Err(CoreError::InvalidResolution(format!(
                "conflict {existing} already open for {}/{}",
                entry.table, entry.global_id
            )));
        }
        warn!(
            conflict = %entry.id,
            table = %entry.table,
            global_id = %entry.global_id,
            detected_on = %entry.detected_on,
            "conflict opened"
        );
        self.commit(&mut entries, RegistryEvent::Opened(entry))
    }

    /// Returns an entry by id.
    pub fn get(&self, id: ConflictId) -> Option<ConflictEntry> {
        self.entries.read().by_id.get(&id).cloned()
    }

    /// Returns the conflict open for a record, if any.
    pub fn open_for(&self, table: &str, global_id: GlobalId) -> Option<ConflictId> {
        self.entries
            .read()
            .by_record
            .get(&(table.to_string(), global_id))
            .copied()
    }

    /// Appends a later change to an open conflict.
    pub fn hold(&self, id: ConflictId, record: ChangeRecord) -> CoreResult<()> {
        let mut entries = self.entries.write();
        if !entries.by_id.contains_key(&id) {
            return Err(CoreError::ConflictNotFound(id));
        }
        self.commit(&mut entries, RegistryEvent::Held { id, record })
    }

    /// Replaces the local side of an open conflict with a later change.
    pub fn replace_local(&self, id: ConflictId, record: ChangeRecord) -> CoreResult<()> {
        let mut entries = self.entries.write();
        if !entries.by_id.contains_key(&id) {
            return Err(CoreError::ConflictNotFound(id));
        }
        self.commit(&mut entries, RegistryEvent::LocalEdit { id, record })
    }

    /// Every open entry, oldest first.
    pub fn list(&self) -> Vec<ConflictEntry> {
        let mut list: Vec<ConflictEntry> = self.entries.read().by_id.values().cloned().collect();
        list.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Closes an entry and returns it.
    pub fn remove(&self, id: ConflictId) -> CoreResult<ConflictEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .by_id
            .get(&id)
            .cloned()
            .ok_or(CoreError::ConflictNotFound(id))?;
        self.commit(&mut entries, RegistryEvent::Closed(id))?;
        Ok(entry)
    }

    /// Number of open entries.
    pub fn len(&self) -> usize {
        self.entries.read().by_id.len()
    }

    /// Returns true if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the journal with only the open entries.
    pub fn compact(&self) -> CoreResult<()> {
        let entries = self.entries.read();
        if let Some(journal) = &self.journal {
            let events: Vec<RegistryEvent> = entries
                .by_id
                .values()
                .cloned()
                .map(RegistryEvent::Opened)
                .collect();
            journal.lock().rewrite(&events)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConflictRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictRegistry")
            .field("open", &self.len())
            .field("durable", &self.journal.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sedesync_protocol::{Direction, Operation, SiteId, Snapshot};
    use tempfile::tempdir;

    fn change(site: SiteId, gid: GlobalId, phone: &str) -> ChangeRecord {
        let mut r = ChangeRecord::captured(
            site,
            "patients",
            gid,
            Operation::Update,
            Some(Snapshot::new().with("phone", phone)),
            Utc::now(),
        );
        r.sequence = 1;
        r.origin_sequence = 1;
        r
    }

    fn entry(gid: GlobalId, age_minutes: i64) -> ConflictEntry {
        ConflictEntry {
            id: ConflictId::new(),
            home_site: SiteId::new(),
            table: "patients".into(),
            global_id: gid,
            local: change(SiteId::new(), gid, "555-0101"),
            remote: change(SiteId::new(), gid, "555-0199"),
            held: Vec::new(),
            detected_on: Direction::Push,
            detected_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn one_open_entry_per_record() {
        let registry = ConflictRegistry::in_memory();
        let gid = GlobalId::new();
        let first = entry(gid, 0);
        registry.open_entry(first.clone()).unwrap();

        assert!(registry.open_entry(entry(gid, 0)).is_err());
        assert_eq!(registry.open_for("patients", gid), Some(first.id));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(first.id).unwrap();
        assert_eq!(removed.id, first.id);
        assert!(registry.open_for("patients", gid).is_none());
        assert!(matches!(
            registry.remove(first.id),
            Err(CoreError::ConflictNotFound(_))
        ));
    }

    #[test]
    fn list_is_oldest_first() {
        let registry = ConflictRegistry::in_memory();
        let newer = entry(GlobalId::new(), 1);
        let older = entry(GlobalId::new(), 30);
        registry.open_entry(newer.clone()).unwrap();
        registry.open_entry(older.clone()).unwrap();

        let ids: Vec<ConflictId> = registry.list().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[test]
    fn journaled_registry_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conflicts.log");
        let gid = GlobalId::new();
        let kept = entry(gid, 0);
        let closed = entry(GlobalId::new(), 0);

        {
            let registry = ConflictRegistry::open(&path).unwrap();
            registry.open_entry(kept.clone()).unwrap();
            registry.open_entry(closed.clone()).unwrap();
            registry
                .hold(kept.id, change(kept.remote.site_id, gid, "555-0200"))
                .unwrap();
            registry.remove(closed.id).unwrap();
            registry.compact().unwrap();
        }

        let registry = ConflictRegistry::open(&path).unwrap();
        assert_eq!(registry.len(), 1);
        let reopened = registry.get(kept.id).unwrap();
        assert_eq!(reopened.held.len(), 1);
        assert_eq!(
            reopened.latest_remote().payload,
            Some(Snapshot::new().with("phone", "555-0200"))
        );
    }

    #[test]
    fn later_local_change_replaces_local_side() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conflicts.log");
        let gid = GlobalId::new();
        let open = entry(gid, 0);
        let mut later = change(open.local.site_id, gid, "555-0102");
        later.sequence = 2;

        {
            let registry = ConflictRegistry::open(&path).unwrap();
            registry.open_entry(open.clone()).unwrap();
            registry.replace_local(open.id, later.clone()).unwrap();
            assert!(matches!(
                registry.replace_local(ConflictId::new(), later.clone()),
                Err(CoreError::ConflictNotFound(_))
            ));
        }

        let registry = ConflictRegistry::open(&path).unwrap();
        let reopened = registry.get(open.id).unwrap();
        assert_eq!(reopened.local.sequence, 2);
        assert_eq!(reopened.local.payload, later.payload);
        assert!(reopened.held.is_empty());
    }
}
