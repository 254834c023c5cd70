//! Node directory management.
//!
//! ```text
//! <node_dir>/
//! ├─ LOCK              # Advisory lock, one process per node
//! ├─ SITE              # CBOR-encoded identity of the home site
//! ├─ changes.log       # ChangeRecord journal (outbox + replicas + cursors)
//! ├─ entities.log      # Entity rows and the applied-change ledger
//! └─ conflicts.log     # Open conflict entries
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use sedesync_protocol::{decode_cbor, encode_cbor, Site};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SITE_FILE: &str = "SITE";
const SITE_TEMP: &str = "SITE.tmp";
const CHANGES_FILE: &str = "changes.log";
const ENTITIES_FILE: &str = "entities.log";
const CONFLICTS_FILE: &str = "conflicts.log";

/// An exclusively locked node directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct NodeDir {
    path: PathBuf,
    _lock_file: File,
}

impl NodeDir {
    /// Opens a node directory, creating it if `create_if_missing` is set.
    ///
    /// Fails with `NodeLocked` if another process holds it.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "node directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::NodeLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the change journal.
    pub fn changes_path(&self) -> PathBuf {
        self.path.join(CHANGES_FILE)
    }

    /// Path of the entity journal.
    pub fn entities_path(&self) -> PathBuf {
        self.path.join(ENTITIES_FILE)
    }

    /// Path of the conflict journal.
    pub fn conflicts_path(&self) -> PathBuf {
        self.path.join(CONFLICTS_FILE)
    }

    /// Reads the stored home site, if provisioned.
    pub fn load_site(&self) -> CoreResult<Option<Site>> {
        let path = self.path.join(SITE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(decode_cbor(&bytes)?))
    }

    /// Stores the home site (write to temp, then rename).
    pub fn save_site(&self, site: &Site) -> CoreResult<()> {
        let tmp = self.path.join(SITE_TEMP);
        fs::write(&tmp, encode_cbor(site)?)?;
        fs::rename(&tmp, self.path.join(SITE_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sedesync_protocol::SiteCode;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_refused() {
        let dir = tempdir().unwrap();
        let first = NodeDir::open(dir.path(), true).unwrap();
        let second = NodeDir::open(dir.path(), true);
        assert!(matches!(second, Err(CoreError::NodeLocked)));
        drop(first);
        assert!(NodeDir::open(dir.path(), false).is_ok());
    }

    #[test]
    fn missing_dir_without_create() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            NodeDir::open(&missing, false),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn site_identity_persists() {
        let dir = tempdir().unwrap();
        let node_dir = NodeDir::open(dir.path(), true).unwrap();
        assert!(node_dir.load_site().unwrap().is_none());

        let site = Site::new(SiteCode::Oriente, "Sede Oriente");
        node_dir.save_site(&site).unwrap();
        assert_eq!(node_dir.load_site().unwrap(), Some(site));
    }
}
