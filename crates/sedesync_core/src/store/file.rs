//! Journal-backed change store.

use super::changelog::{ChangeEvent, ChangeLog};
use super::LogCore;
use crate::error::CoreResult;
use crate::journal::Journal;
use std::path::{Path, PathBuf};
use tracing::info;

/// A change store persisted as an append-only journal.
///
/// Every mutation is journaled before it becomes visible. Cleanup
/// rewrites the journal so purged records do not linger on disk.
pub struct FileChangeStore {
    core: LogCore,
    path: PathBuf,
}

impl FileChangeStore {
    /// Opens or creates the store at `path`, replaying its journal.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let (journal, events) = Journal::open::<ChangeEvent>(path)?;
        let log = ChangeLog::from_events(events);
        info!(
            path = %path.display(),
            head = log.head(),
            "change store opened"
        );
        Ok(Self {
            core: LogCore::new(log, Some(journal)),
            path: path.to_path_buf(),
        })
    }

    /// Journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

super::forward_change_store!(FileChangeStore);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeStore;
    use chrono::{Duration, Utc};
    use sedesync_protocol::{ChangeRecord, GlobalId, Operation, RecordStatus, SiteId, Snapshot};
    use tempfile::tempdir;

    fn synced(site: SiteId, age_days: i64) -> ChangeRecord {
        let mut r = ChangeRecord::captured(
            site,
            "invoices",
            GlobalId::new(),
            Operation::Create,
            Some(Snapshot::new().with("total", "120.50")),
            Utc::now(),
        );
        r.status = RecordStatus::Synced;
        r.updated_at = Utc::now() - Duration::days(age_days);
        r
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changes.log");
        let site = SiteId::new();
        let peer = SiteId::new();

        {
            let store = FileChangeStore::open(&path).unwrap();
            let r = store.append(synced(site, 0)).unwrap();
            let p = store
                .append(ChangeRecord::captured(
                    site,
                    "invoices",
                    GlobalId::new(),
                    Operation::Delete,
                    None,
                    Utc::now(),
                ))
                .unwrap();
            store
                .transition(p.sequence, RecordStatus::Pending, RecordStatus::Failed, Some("x".into()))
                .unwrap();
            store.save_cursor(peer, 77).unwrap();
            assert_eq!(r.sequence, 1);
        }

        let store = FileChangeStore::open(&path).unwrap();
        let counts = store.counts(site).unwrap();
        assert_eq!((counts.synced, counts.failed), (1, 1));
        assert_eq!(store.load_cursor(peer).unwrap(), 77);
        assert_eq!(store.head().unwrap(), 2);
    }

    #[test]
    fn sequences_are_not_reused_after_purge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changes.log");
        let site = SiteId::new();

        {
            let store = FileChangeStore::open(&path).unwrap();
            store.append(synced(site, 60)).unwrap();
            store.append(synced(site, 60)).unwrap();
            assert_eq!(store.purge_synced_before(Utc::now() - Duration::days(30)).unwrap(), 2);
        }

        let store = FileChangeStore::open(&path).unwrap();
        assert_eq!(store.head().unwrap(), 2);
        let next = store.append(synced(site, 0)).unwrap();
        assert_eq!(next.sequence, 3);
    }
}
