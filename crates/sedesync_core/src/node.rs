//! A site node: every store of one home site bundled together.

use crate::apply::{ApplyContext, ApplyEngine};
use crate::capture::{CaptureContext, CaptureOutcome, ChangeCapture, SyncHooks};
use crate::dir::NodeDir;
use crate::entity::{EntityRow, EntityStore, EntityWrite, FileEntityStore, MemoryEntityStore};
use crate::error::{CoreError, CoreResult};
use crate::reconcile::TableReconcile;
use crate::registry::ConflictRegistry;
use crate::resolution::Resolution;
use crate::store::{ChangeStore, FileChangeStore, MemoryChangeStore};
use chrono::{DateTime, Utc};
use sedesync_protocol::{
    ApplyOutcome, ChangeRecord, ConflictDecision, ConflictId, FullSyncResponse, GlobalId,
    RecordStatus, Site, SiteId, SnapshotRow, TableSnapshot,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Change store, entity store, capture, apply engine and conflict registry
/// of one home site.
///
/// # Example
///
/// ```ignore
/// use sedesync_core::SiteNode;
/// use sedesync_protocol::{Site, SiteCode};
///
/// let node = SiteNode::in_memory(Site::new(SiteCode::Norte, "Sede Norte"));
/// node.save_entity(&patient, CaptureContext::Syncing)?;
/// ```
pub struct SiteNode {
    site: Site,
    changes: Arc<dyn ChangeStore>,
    entities: Arc<dyn EntityStore>,
    conflicts: Arc<ConflictRegistry>,
    capture: ChangeCapture,
    apply: ApplyEngine,
    _dir: Option<NodeDir>,
}

impl SiteNode {
    fn assemble(
        site: Site,
        changes: Arc<dyn ChangeStore>,
        entities: Arc<dyn EntityStore>,
        conflicts: Arc<ConflictRegistry>,
        dir: Option<NodeDir>,
    ) -> Self {
        let capture = ChangeCapture::new(site.id, Arc::clone(&changes));
        let apply = ApplyEngine::new(
            site.id,
            Arc::clone(&changes),
            Arc::clone(&entities),
            Arc::clone(&conflicts),
        );
        Self {
            site,
            changes,
            entities,
            conflicts,
            capture,
            apply,
            _dir: dir,
        }
    }

    /// Creates a node whose state lives only in memory.
    pub fn in_memory(site: Site) -> Self {
        Self::assemble(
            site,
            Arc::new(MemoryChangeStore::new()),
            Arc::new(MemoryEntityStore::new()),
            Arc::new(ConflictRegistry::in_memory()),
            None,
        )
    }

    /// Opens or provisions a durable node in `path` for `site`.
    ///
    /// Fails if the directory already belongs to a different site.
    pub fn open(path: &Path, site: Site) -> CoreResult<Self> {
        let dir = NodeDir::open(path, true)?;
        match dir.load_site()? {
            Some(stored) if stored.id != site.id => {
                return Err(CoreError::invalid_format(format!(
                    "directory belongs to site {}, not {}",
                    stored.code, site.code
                )));
            }
            Some(_) => {}
            None => dir.save_site(&site)?,
        }
        Self::open_dir(dir, site)
    }

    /// Opens a node that was provisioned earlier.
    pub fn open_existing(path: &Path) -> CoreResult<Self> {
        let dir = NodeDir::open(path, false)?;
        let site = dir
            .load_site()?
            .ok_or_else(|| CoreError::invalid_format("node directory has no site identity"))?;
        Self::open_dir(dir, site)
    }

    fn open_dir(dir: NodeDir, site: Site) -> CoreResult<Self> {
        let changes = Arc::new(FileChangeStore::open(&dir.changes_path())?);
        let entities = Arc::new(FileEntityStore::open(&dir.entities_path())?);
        let conflicts = Arc::new(ConflictRegistry::open(&dir.conflicts_path())?);
        info!(site = %site, path = %dir.path().display(), "node opened");
        Ok(Self::assemble(site, changes, entities, conflicts, Some(dir)))
    }

    /// The home site.
    pub fn site(&self) -> &Site {
        &self.site
    }

    /// Home site id.
    pub fn id(&self) -> SiteId {
        self.site.id
    }

    /// The change store.
    pub fn changes(&self) -> &Arc<dyn ChangeStore> {
        &self.changes
    }

    /// The entity store.
    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    /// The conflict registry.
    pub fn conflicts(&self) -> &ConflictRegistry {
        &self.conflicts
    }

    /// The change capture.
    pub fn capture(&self) -> &ChangeCapture {
        &self.capture
    }

    /// Writes an entity and fires its create or update hook.
    ///
    /// A write to a missing or deleted record is a create. The row write
    /// and its capture run under the apply lock, so an incoming change for
    /// the same record sees either both or neither.
    pub fn save_entity<E: SyncHooks>(
        &self,
        entity: &E,
        ctx: CaptureContext,
    ) -> CoreResult<CaptureOutcome> {
        let _guard = self.apply.lock.lock();
        let existing = self.entities.get(entity.table(), entity.global_id())?;
        let created = !existing.as_ref().is_some_and(EntityRow::is_live);
        self.entities.commit(EntityWrite::row(EntityRow {
            table: entity.table().to_string(),
            global_id: entity.global_id(),
            site_id: entity.site_id(),
            local_id: entity.local_id(),
            payload: Some(entity.snapshot()),
            updated_at: Utc::now(),
        }))?;
        Ok(if created {
            entity.on_created(&self.capture, ctx)
        } else {
            entity.on_updated(&self.capture, ctx)
        })
    }

    /// Deletes an entity and fires its delete hook.
    pub fn delete_entity<E: SyncHooks>(
        &self,
        entity: &E,
        ctx: CaptureContext,
    ) -> CoreResult<CaptureOutcome> {
        let _guard = self.apply.lock.lock();
        let existing = self
            .entities
            .get(entity.table(), entity.global_id())?
            .filter(EntityRow::is_live)
            .ok_or_else(|| CoreError::EntityNotFound {
                table: entity.table().to_string(),
                global_id: entity.global_id(),
            })?;
        self.entities.commit(EntityWrite::row(EntityRow {
            payload: None,
            updated_at: Utc::now(),
            ..existing
        }))?;
        Ok(entity.on_deleted(&self.capture, ctx))
    }

    /// Current row of a record, tombstones included.
    pub fn entity(&self, table: &str, global_id: GlobalId) -> CoreResult<Option<EntityRow>> {
        self.entities.get(table, global_id)
    }

    /// Applies an incoming batch.
    pub fn apply_batch(
        &self,
        ctx: &ApplyContext,
        records: &[ChangeRecord],
    ) -> CoreResult<Vec<ApplyOutcome>> {
        self.apply.apply_batch(ctx, records)
    }

    /// Holds a local PENDING record behind the conflict open here for its
    /// record, if any.
    pub fn hold_local(&self, record: &ChangeRecord) -> CoreResult<Option<ConflictId>> {
        self.apply.hold_local(record)
    }

    /// Resolves one open conflict.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        decision: &ConflictDecision,
    ) -> CoreResult<Resolution> {
        self.apply.resolve_conflict(id, decision)
    }

    /// Reconciles one table against a canonical snapshot.
    pub fn reconcile(
        &self,
        snapshot: &TableSnapshot,
        remove_missing: bool,
    ) -> CoreResult<TableReconcile> {
        self.apply.reconcile_table(snapshot, remove_missing)
    }

    /// Live contents of the given tables, or of every table.
    ///
    /// The cursor is the log head at snapshot time.
    pub fn snapshot(&self, tables: Option<&[String]>) -> CoreResult<FullSyncResponse> {
        let _guard = self.apply.lock.lock();
        let names = match tables {
            Some(names) => names.to_vec(),
            None => self.entities.tables()?,
        };
        let mut snapshots = Vec::with_capacity(names.len());
        for table in names {
            let rows = self
                .entities
                .rows(&table)?
                .into_iter()
                .filter_map(|row| {
                    row.payload.map(|payload| SnapshotRow {
                        global_id: row.global_id,
                        site_id: row.site_id,
                        local_id: row.local_id,
                        payload,
                    })
                })
                .collect();
            snapshots.push(TableSnapshot { table, rows });
        }
        Ok(FullSyncResponse {
            cursor: self.changes.head()?,
            tables: snapshots,
        })
    }

    /// Marks every PENDING record of the home site as SYNCED.
    ///
    /// Used by the hub, whose own log is the destination of its captures.
    pub fn publish_pending(&self) -> CoreResult<usize> {
        let pending = self.changes.pending_for_site(self.site.id, usize::MAX)?;
        for record in &pending {
            self.changes.transition(
                record.sequence,
                RecordStatus::Pending,
                RecordStatus::Synced,
                None,
            )?;
        }
        Ok(pending.len())
    }

    /// Deletes SYNCED records last updated before `cutoff` and compacts
    /// the node's journals.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let purged = self.changes.purge_synced_before(cutoff)?;
        self.entities.compact()?;
        self.conflicts.compact()?;
        info!(site = %self.site.code, purged, %cutoff, "retention cleanup done");
        Ok(purged)
    }
}

impl std::fmt::Debug for SiteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteNode")
            .field("site", &self.site)
            .field("conflicts", &self.conflicts.len())
            .finish_non_exhaustive()
    }
}
