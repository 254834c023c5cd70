//! Full-sync reconciliation of one table against a canonical snapshot.

use crate::apply::ApplyEngine;
use crate::entity::{EntityRow, EntityWrite};
use crate::error::CoreResult;
use chrono::Utc;
use sedesync_protocol::{GlobalId, TableSnapshot};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// Reason reported for rows a full sync will not overwrite.
pub const LOCAL_CHANGES_PENDING: &str = "local changes pending";

/// A row the reconciliation left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// Record identifier.
    pub global_id: GlobalId,
    /// Why it was skipped.
    pub reason: String,
}

/// Per-table full-sync counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReconcile {
    /// Table name.
    pub table: String,
    /// Rows in the canonical snapshot.
    pub total: usize,
    /// Rows inserted or revived locally.
    pub inserted: usize,
    /// Rows whose payload was replaced.
    pub updated: usize,
    /// Rows already identical.
    pub unchanged: usize,
    /// Local rows absent remotely that were tombstoned.
    pub removed: usize,
    /// Rows skipped.
    pub failed: usize,
    /// One entry per skipped row.
    pub errors: Vec<RowError>,
}

impl TableReconcile {
    /// Rows that now match the snapshot.
    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

impl ApplyEngine {
    /// Reconciles the local table with a canonical snapshot.
    ///
    /// Rows with unsynchronized local changes or an open conflict are
    /// never overwritten. Local rows missing from the snapshot are only
    /// tombstoned when `remove_missing` is set.
    pub fn reconcile_table(
        &self,
        snapshot: &TableSnapshot,
        remove_missing: bool,
    ) -> CoreResult<TableReconcile> {
        let _guard = self.lock.lock();
        let table = snapshot.table.as_str();
        let mut report = TableReconcile {
            table: table.to_string(),
            total: snapshot.rows.len(),
            ..TableReconcile::default()
        };

        for row in &snapshot.rows {
            if let Some(reason) = self.blocked(table, row.global_id)? {
                report.failed += 1;
                report.errors.push(RowError {
                    global_id: row.global_id,
                    reason: reason.to_string(),
                });
                continue;
            }

            let existing = self.entities.get(table, row.global_id)?;
            match existing.as_ref().and_then(|r| r.payload.as_ref()) {
                Some(current) if *current == row.payload => {
                    report.unchanged += 1;
                    continue;
                }
                Some(_) => report.updated += 1,
                None => report.inserted += 1,
            }
            self.entities.commit(EntityWrite::row(EntityRow {
                table: table.to_string(),
                global_id: row.global_id,
                site_id: row.site_id,
                local_id: existing.and_then(|r| r.local_id).or(row.local_id),
                payload: Some(row.payload.clone()),
                updated_at: Utc::now(),
            }))?;
        }

        if remove_missing {
            let canonical: HashSet<GlobalId> =
                snapshot.rows.iter().map(|r| r.global_id).collect();
            for local in self.entities.rows(table)? {
                if !local.is_live() || canonical.contains(&local.global_id) {
                    continue;
                }
                if self.blocked(table, local.global_id)?.is_some() {
                    debug!(table, global_id = %local.global_id, "kept row with local changes");
                    continue;
                }
                self.entities.commit(EntityWrite::row(EntityRow {
                    payload: None,
                    updated_at: Utc::now(),
                    ..local
                }))?;
                report.removed += 1;
            }
        }

        info!(
            table,
            total = report.total,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            "table reconciled"
        );
        Ok(report)
    }

    fn blocked(&self, table: &str, global_id: GlobalId) -> CoreResult<Option<&'static str>> {
        if self.conflicts.open_for(table, global_id).is_some() {
            return Ok(Some("conflict open"));
        }
        let pending = self
            .changes
            .history_for(table, global_id)?
            .iter()
            .any(|r| r.site_id == self.home && r.is_unsynced());
        Ok(pending.then_some(LOCAL_CHANGES_PENDING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityStore, MemoryEntityStore};
    use crate::registry::ConflictRegistry;
    use crate::store::{ChangeStore, MemoryChangeStore};
    use sedesync_protocol::{ChangeRecord, Operation, SiteId, Snapshot, SnapshotRow};
    use std::sync::Arc;

    fn row(site: SiteId, gid: GlobalId, name: &str) -> SnapshotRow {
        SnapshotRow {
            global_id: gid,
            site_id: site,
            local_id: None,
            payload: Snapshot::new().with("name", name),
        }
    }

    fn seed(entities: &MemoryEntityStore, site: SiteId, gid: GlobalId, name: &str) {
        entities
            .commit(EntityWrite::row(EntityRow {
                table: "patients".into(),
                global_id: gid,
                site_id: site,
                local_id: Some(4),
                payload: Some(Snapshot::new().with("name", name)),
                updated_at: Utc::now(),
            }))
            .unwrap();
    }

    #[test]
    fn counts_every_kind_of_row() {
        let home = SiteId::new();
        let hub = SiteId::new();
        let changes = Arc::new(MemoryChangeStore::new());
        let entities = Arc::new(MemoryEntityStore::new());
        let engine = ApplyEngine::new(
            home,
            changes.clone(),
            entities.clone(),
            Arc::new(ConflictRegistry::in_memory()),
        );

        let same = GlobalId::new();
        let stale = GlobalId::new();
        let dirty = GlobalId::new();
        let orphan = GlobalId::new();
        let fresh = GlobalId::new();
        seed(&entities, hub, same, "Ana");
        seed(&entities, hub, stale, "Old");
        seed(&entities, home, dirty, "Mine");
        seed(&entities, home, orphan, "Gone");
        changes
            .append(ChangeRecord::captured(
                home,
                "patients",
                dirty,
                Operation::Update,
                Some(Snapshot::new().with("name", "Mine")),
                Utc::now(),
            ))
            .unwrap();

        let snapshot = TableSnapshot {
            table: "patients".into(),
            rows: vec![
                row(hub, same, "Ana"),
                row(hub, stale, "New"),
                row(hub, dirty, "Theirs"),
                row(hub, fresh, "Eva"),
            ],
        };

        let report = engine.reconcile_table(&snapshot, false).unwrap();
        assert_eq!(
            (report.total, report.inserted, report.updated, report.unchanged, report.failed),
            (4, 1, 1, 1, 1)
        );
        assert_eq!(report.applied(), 3);
        assert_eq!(report.errors[0].reason, LOCAL_CHANGES_PENDING);
        assert!(entities.get("patients", orphan).unwrap().unwrap().is_live());

        let stale_row = entities.get("patients", stale).unwrap().unwrap();
        assert_eq!(stale_row.local_id, Some(4));
        assert_eq!(stale_row.payload, Some(Snapshot::new().with("name", "New")));

        let report = engine.reconcile_table(&snapshot, true).unwrap();
        assert_eq!(report.removed, 1);
        assert!(!entities.get("patients", orphan).unwrap().unwrap().is_live());
        let dirty_row = entities.get("patients", dirty).unwrap().unwrap();
        assert_eq!(dirty_row.payload, Some(Snapshot::new().with("name", "Mine")));
    }
}
