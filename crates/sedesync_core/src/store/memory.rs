//! In-memory change store.

use super::changelog::ChangeLog;
use super::LogCore;

/// A change store that lives only in memory.
///
/// Used for tests and for nodes whose durability is handled elsewhere.
pub struct MemoryChangeStore {
    core: LogCore,
}

impl MemoryChangeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            core: LogCore::new(ChangeLog::default(), None),
        }
    }
}

impl Default for MemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChangeStore").finish_non_exhaustive()
    }
}

super::forward_change_store!(MemoryChangeStore);
