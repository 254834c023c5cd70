//! In-memory state shared by the change store implementations.

use super::{ChangePage, ChangeQuery, StatusCounts};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use sedesync_protocol::{ChangeRecord, ConflictId, GlobalId, RecordStatus, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One durable mutation of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum ChangeEvent {
    /// Insert or replace a record.
    Put(ChangeRecord),
    /// Delete records by sequence.
    Purge(Vec<u64>),
    /// Pull watermark for a peer.
    Cursor { peer: SiteId, cursor: u64 },
    /// Highest sequence ever assigned; survives purges.
    HighWater(u64),
}

/// Records plus the (site, status) and (table, global id) indexes.
#[derive(Debug, Default)]
pub(crate) struct ChangeLog {
    records: BTreeMap<u64, ChangeRecord>,
    by_site_status: HashMap<(SiteId, RecordStatus), BTreeSet<u64>>,
    by_entity: HashMap<(String, GlobalId), BTreeSet<u64>>,
    cursors: HashMap<SiteId, u64>,
    last_sequence: u64,
}

impl ChangeLog {
    pub(crate) fn from_events(events: Vec<ChangeEvent>) -> Self {
        let mut log = Self::default();
        for event in &events {
            log.apply(event);
        }
        log
    }

    pub(crate) fn apply(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Put(record) => {
                if let Some(old) = self.records.remove(&record.sequence) {
                    self.unindex(&old);
                }
                self.index(record);
                self.last_sequence = self.last_sequence.max(record.sequence);
                self.records.insert(record.sequence, record.clone());
            }
            ChangeEvent::Purge(sequences) => {
                for seq in sequences {
                    if let Some(old) = self.records.remove(seq) {
                        self.unindex(&old);
                    }
                }
            }
            ChangeEvent::Cursor { peer, cursor } => {
                self.cursors.insert(*peer, *cursor);
            }
            ChangeEvent::HighWater(seq) => {
                self.last_sequence = self.last_sequence.max(*seq);
            }
        }
    }

    fn index(&mut self, record: &ChangeRecord) {
        self.by_site_status
            .entry((record.site_id, record.status))
            .or_default()
            .insert(record.sequence);
        self.by_entity
            .entry((record.table.clone(), record.global_id))
            .or_default()
            .insert(record.sequence);
    }

    fn unindex(&mut self, record: &ChangeRecord) {
        let key = (record.site_id, record.status);
        if let Some(set) = self.by_site_status.get_mut(&key) {
            set.remove(&record.sequence);
            if set.is_empty() {
                self.by_site_status.remove(&key);
            }
        }
        let key = (record.table.clone(), record.global_id);
        if let Some(set) = self.by_entity.get_mut(&key) {
            set.remove(&record.sequence);
            if set.is_empty() {
                self.by_entity.remove(&key);
            }
        }
    }

    /// Events that rebuild this log from scratch.
    pub(crate) fn snapshot_events(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::with_capacity(self.records.len() + self.cursors.len() + 1);
        events.push(ChangeEvent::HighWater(self.last_sequence));
        events.extend(self.records.values().cloned().map(ChangeEvent::Put));
        events.extend(
            self.cursors
                .iter()
                .map(|(peer, cursor)| ChangeEvent::Cursor {
                    peer: *peer,
                    cursor: *cursor,
                }),
        );
        events
    }

    pub(crate) fn plan_append(&self, mut record: ChangeRecord) -> ChangeRecord {
        record.sequence = self.last_sequence + 1;
        if record.origin_sequence == 0 {
            record.origin_sequence = record.sequence;
        }
        record
    }

    fn existing(&self, sequence: u64) -> CoreResult<&ChangeRecord> {
        self.records
            .get(&sequence)
            .ok_or(CoreError::RecordNotFound { sequence })
    }

    pub(crate) fn plan_transition(
        &self,
        sequence: u64,
        expected: RecordStatus,
        next: RecordStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> CoreResult<ChangeRecord> {
        let current = self.existing(sequence)?;
        if current.status != expected {
            return Err(CoreError::StatusMismatch {
                sequence,
                expected,
                actual: current.status,
            });
        }
        let status = expected.transition_to(next)?;
        let mut updated = current.clone();
        updated.status = status;
        updated.error_detail = if status == RecordStatus::Failed {
            Some(error.unwrap_or_else(|| "unspecified failure".into()))
        } else {
            None
        };
        updated.conflict = None;
        updated.updated_at = at;
        Ok(updated)
    }

    pub(crate) fn plan_flag(
        &self,
        sequence: u64,
        conflict: ConflictId,
        at: DateTime<Utc>,
    ) -> CoreResult<ChangeRecord> {
        let current = self.existing(sequence)?;
        if current.status != RecordStatus::Pending {
            return Err(CoreError::StatusMismatch {
                sequence,
                expected: RecordStatus::Pending,
                actual: current.status,
            });
        }
        let mut updated = current.clone();
        updated.conflict = Some(conflict);
        updated.updated_at = at;
        Ok(updated)
    }

    pub(crate) fn plan_requeue(&self, site: SiteId, at: DateTime<Utc>) -> Vec<ChangeRecord> {
        self.with_status(site, RecordStatus::Failed)
            .map(|record| {
                let mut updated = record.clone();
                updated.status = RecordStatus::Pending;
                updated.error_detail = None;
                updated.updated_at = at;
                updated
            })
            .collect()
    }

    pub(crate) fn plan_purge(&self, cutoff: DateTime<Utc>) -> Vec<u64> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Synced && r.updated_at < cutoff)
            .map(|r| r.sequence)
            .collect()
    }

    pub(crate) fn get(&self, sequence: u64) -> Option<&ChangeRecord> {
        self.records.get(&sequence)
    }

    pub(crate) fn with_status(
        &self,
        site: SiteId,
        status: RecordStatus,
    ) -> impl Iterator<Item = &ChangeRecord> + '_ {
        self.by_site_status
            .get(&(site, status))
            .into_iter()
            .flatten()
            .filter_map(|seq| self.records.get(seq))
    }

    pub(crate) fn history(&self, table: &str, global_id: GlobalId) -> Vec<ChangeRecord> {
        self.by_entity
            .get(&(table.to_string(), global_id))
            .into_iter()
            .flatten()
            .filter_map(|seq| self.records.get(seq))
            .cloned()
            .collect()
    }

    pub(crate) fn flagged_with(&self, conflict: ConflictId) -> Vec<ChangeRecord> {
        self.records
            .values()
            .filter(|r| r.conflict == Some(conflict))
            .cloned()
            .collect()
    }

    pub(crate) fn page(&self, query: &ChangeQuery) -> ChangePage {
        let limit = query.limit.max(1);
        let mut records = Vec::new();
        let mut cursor = query.since;
        let mut has_more = false;

        for (seq, record) in self.records.range(query.since.saturating_add(1)..) {
            // The watermark never moves past a record that is still settling.
            if record.status == RecordStatus::Pending {
                break;
            }
            let wanted = record.status == RecordStatus::Synced
                && query.exclude_origin != Some(record.site_id)
                && query
                    .tables
                    .as_ref()
                    .map_or(true, |tables| tables.iter().any(|t| t == &record.table));
            if wanted {
                if records.len() == limit {
                    has_more = true;
                    break;
                }
                records.push(record.clone());
            }
            cursor = *seq;
        }

        ChangePage {
            records,
            new_cursor: cursor,
            has_more,
        }
    }

    pub(crate) fn counts(&self, site: SiteId) -> StatusCounts {
        let count = |status: RecordStatus| {
            self.by_site_status
                .get(&(site, status))
                .map_or(0, BTreeSet::len)
        };
        let flagged = self
            .with_status(site, RecordStatus::Pending)
            .filter(|r| r.is_flagged())
            .count();
        let replicas = self.records.values().filter(|r| r.site_id != site).count();
        StatusCounts {
            pending: count(RecordStatus::Pending),
            synced: count(RecordStatus::Synced),
            failed: count(RecordStatus::Failed),
            flagged,
            replicas,
        }
    }

    pub(crate) fn head(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn cursor(&self, peer: SiteId) -> u64 {
        self.cursors.get(&peer).copied().unwrap_or(0)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &ChangeRecord> + '_ {
        self.records.values()
    }
}
