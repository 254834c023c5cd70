//! Operator resolution of open conflicts.

use crate::apply::ApplyEngine;
use crate::entity::{AppliedMark, EntityRow, EntityWrite};
use crate::error::{CoreError, CoreResult};
use chrono::Utc;
use sedesync_protocol::{
    ChangeRecord, ConflictDecision, ConflictId, Direction, Operation, RecordStatus,
};
use serde::Serialize;
use std::iter;
use tracing::info;

/// What a resolution wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Resolved conflict.
    pub conflict_id: ConflictId,
    /// Decision taken.
    pub decision: &'static str,
    /// The new authoritative SYNCED record.
    pub record: ChangeRecord,
    /// PENDING copy queued for the hub, when the decision must travel.
    pub published: Option<ChangeRecord>,
    /// Sequences of local records superseded by the resolution.
    pub superseded: Vec<u64>,
}

impl ApplyEngine {
    /// Resolves one conflict with an operator decision.
    ///
    /// The winning state is written as a new SYNCED record carrying
    /// `resolves = id`. Local records held behind the conflict are
    /// superseded and the remote records are marked applied, so replays
    /// cannot reopen the conflict.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        decision: &ConflictDecision,
    ) -> CoreResult<Resolution> {
        let _guard = self.lock.lock();
        let entry = self.conflicts.get(id).ok_or(CoreError::ConflictNotFound(id))?;

        let (winner, payload) = decision.winner(&entry);
        if winner.carries_payload() && payload.is_none() {
            return Err(CoreError::InvalidResolution(format!(
                "{} keeps a {winner} without payload",
                decision.as_str()
            )));
        }

        let existing = self.entities.get(&entry.table, entry.global_id)?;
        let live = existing.as_ref().is_some_and(EntityRow::is_live);
        let operation = match winner {
            Operation::Delete => Operation::Delete,
            Operation::Create | Operation::Update if live => Operation::Update,
            Operation::Create | Operation::Update => Operation::Create,
        };

        let now = Utc::now();
        let mut authoritative = ChangeRecord::captured(
            self.home,
            entry.table.clone(),
            entry.global_id,
            operation,
            payload.clone(),
            now,
        )
        .with_local_id(entry.local.local_id);
        authoritative.status = RecordStatus::Synced;
        authoritative.resolves = Some(id);
        let record = self.changes.append(authoritative)?;

        let mut write = EntityWrite::row(EntityRow {
            table: entry.table.clone(),
            global_id: entry.global_id,
            site_id: existing.as_ref().map_or(entry.local.site_id, |r| r.site_id),
            local_id: existing.as_ref().and_then(|r| r.local_id).or(record.local_id),
            payload: payload.clone(),
            updated_at: now,
        });
        for applied in iter::once(&record)
            .chain(iter::once(&entry.remote))
            .chain(entry.held.iter())
            .filter(|r| r.site_id != self.home || r.resolves == Some(id))
        {
            write = write.with_mark(AppliedMark {
                origin: applied.origin_key(),
                global_id: entry.global_id,
                fingerprint: applied.fingerprint(),
            });
        }
        self.entities.commit(write)?;

        let mut superseded = Vec::new();
        for local in self.changes.flagged_with(id)? {
            self.changes.transition(
                local.sequence,
                RecordStatus::Pending,
                RecordStatus::Synced,
                None,
            )?;
            superseded.push(local.sequence);
        }

        let published = if entry.detected_on == Direction::Pull
            && !matches!(decision, ConflictDecision::KeepRemote)
        {
            let pending = ChangeRecord::captured(
                self.home,
                entry.table.clone(),
                entry.global_id,
                operation,
                payload,
                now,
            )
            .with_local_id(record.local_id);
            Some(self.changes.append(pending)?)
        } else {
            None
        };

        self.conflicts.remove(id)?;
        info!(
            conflict = %id,
            decision = decision.as_str(),
            table = %entry.table,
            global_id = %entry.global_id,
            sequence = record.sequence,
            superseded = superseded.len(),
            "conflict resolved"
        );

        Ok(Resolution {
            conflict_id: id,
            decision: decision.as_str(),
            record,
            published,
            superseded,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::apply::{ApplyContext, ApplyEngine};
    use crate::entity::{EntityStore, MemoryEntityStore};
    use crate::error::CoreError;
    use crate::registry::ConflictRegistry;
    use crate::store::{ChangeStore, MemoryChangeStore};
    use chrono::Utc;
    use sedesync_protocol::{
        ApplyOutcome, ChangeRecord, ConflictDecision, ConflictId, GlobalId, Operation,
        RecordStatus, SiteId, Snapshot,
    };
    use std::sync::Arc;

    struct Node {
        home: SiteId,
        changes: Arc<MemoryChangeStore>,
        entities: Arc<MemoryEntityStore>,
        engine: ApplyEngine,
    }

    fn node() -> Node {
        let home = SiteId::new();
        let changes = Arc::new(MemoryChangeStore::new());
        let entities = Arc::new(MemoryEntityStore::new());
        let engine = ApplyEngine::new(
            home,
            changes.clone(),
            entities.clone(),
            Arc::new(ConflictRegistry::in_memory()),
        );
        Node {
            home,
            changes,
            entities,
            engine,
        }
    }

    fn change(site: SiteId, seq: u64, gid: GlobalId, op: Operation, phone: &str) -> ChangeRecord {
        let payload = op
            .carries_payload()
            .then(|| Snapshot::new().with("phone", phone));
        let mut r = ChangeRecord::captured(site, "patients", gid, op, payload, Utc::now());
        r.sequence = seq;
        r.origin_sequence = seq;
        r
    }

    /// Opens a pull-detected conflict and returns its id and the local record.
    fn pull_conflict(n: &Node, sur: SiteId, gid: GlobalId) -> (ConflictId, ChangeRecord) {
        let pull = ApplyContext::pull(SiteId::new());
        n.engine
            .apply(&pull, &change(sur, 1, gid, Operation::Create, "1"))
            .unwrap();
        let mut own = change(n.home, 0, gid, Operation::Update, "local");
        own.origin_sequence = 0;
        let own = n.changes.append(own).unwrap();
        let outcome = n
            .engine
            .apply(&pull, &change(sur, 2, gid, Operation::Update, "remote"))
            .unwrap();
        let ApplyOutcome::Conflict { conflict_id, .. } = outcome else {
            panic!("expected conflict");
        };
        (conflict_id, own)
    }

    fn phone(n: &Node, gid: GlobalId) -> Option<String> {
        let payload = n.entities.get("patients", gid).unwrap()?.payload?;
        match payload.get("phone")? {
            sedesync_protocol::FieldValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    #[test]
    fn keep_local_republishes_and_supersedes() {
        let n = node();
        let sur = SiteId::new();
        let gid = GlobalId::new();
        let (id, own) = pull_conflict(&n, sur, gid);

        let resolution = n
            .engine
            .resolve_conflict(id, &ConflictDecision::KeepLocal)
            .unwrap();
        assert_eq!(resolution.superseded, vec![own.sequence]);
        assert_eq!(resolution.record.resolves, Some(id));
        assert_eq!(resolution.record.status, RecordStatus::Synced);
        assert_eq!(phone(&n, gid).as_deref(), Some("local"));

        let published = resolution.published.unwrap();
        assert_eq!(published.status, RecordStatus::Pending);
        assert_eq!(n.changes.pending_for_site(n.home, 10).unwrap(), vec![published]);
        assert_eq!(
            n.changes.get(own.sequence).unwrap().unwrap().status,
            RecordStatus::Synced
        );

        assert!(matches!(
            n.engine.resolve_conflict(id, &ConflictDecision::KeepLocal),
            Err(CoreError::ConflictNotFound(_))
        ));
    }

    #[test]
    fn keep_remote_marks_remote_applied() {
        let n = node();
        let sur = SiteId::new();
        let gid = GlobalId::new();
        let (id, _) = pull_conflict(&n, sur, gid);

        let resolution = n
            .engine
            .resolve_conflict(id, &ConflictDecision::KeepRemote)
            .unwrap();
        assert!(resolution.published.is_none());
        assert_eq!(phone(&n, gid).as_deref(), Some("remote"));

        let replay = n
            .engine
            .apply(
                &ApplyContext::pull(SiteId::new()),
                &change(sur, 2, gid, Operation::Update, "remote"),
            )
            .unwrap();
        assert_eq!(replay, ApplyOutcome::Applied { duplicate: true });
        assert!(n.changes.pending_for_site(n.home, 10).unwrap().is_empty());
    }

    #[test]
    fn merged_payload_wins() {
        let n = node();
        let gid = GlobalId::new();
        let (id, _) = pull_conflict(&n, SiteId::new(), gid);

        let merged = Snapshot::new().with("phone", "merged");
        let resolution = n
            .engine
            .resolve_conflict(id, &ConflictDecision::Merged(merged.clone()))
            .unwrap();
        assert_eq!(resolution.record.operation, Operation::Update);
        assert_eq!(resolution.record.payload, Some(merged));
        assert_eq!(phone(&n, gid).as_deref(), Some("merged"));
    }

    #[test]
    fn resolution_record_supersedes_at_the_flagged_peer() {
        let hub = node();
        let spoke = node();
        let gid = GlobalId::new();
        let sur = SiteId::new();

        let (id, _) = pull_conflict(&hub, sur, gid);
        let resolution = hub
            .engine
            .resolve_conflict(id, &ConflictDecision::KeepRemote)
            .unwrap();

        spoke
            .engine
            .apply(
                &ApplyContext::pull(SiteId::new()),
                &change(sur, 1, gid, Operation::Create, "1"),
            )
            .unwrap();
        let mut flagged = change(spoke.home, 0, gid, Operation::Update, "spoke");
        flagged.origin_sequence = 0;
        let flagged = spoke.changes.append(flagged).unwrap();
        spoke.changes.flag(flagged.sequence, id).unwrap();

        let outcome = spoke
            .engine
            .apply(&ApplyContext::pull(hub.home), &resolution.record)
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(phone(&spoke, gid).as_deref(), Some("remote"));
        assert_eq!(
            spoke.changes.get(flagged.sequence).unwrap().unwrap().status,
            RecordStatus::Synced
        );
    }
}
