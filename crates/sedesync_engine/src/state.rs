//! Per-site run state and statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// What a site's runner is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No run in progress.
    Idle,
    /// Sending PENDING records to the peer.
    Pushing,
    /// Fetching and applying the peer's changes.
    Pulling,
    /// Reconciling tables against a canonical snapshot.
    Reconciling,
    /// Waiting before retrying a transport call.
    RetryWait,
    /// The last run failed.
    Error,
}

impl SyncState {
    /// Returns true if a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pushing | SyncState::Pulling | SyncState::Reconciling | SyncState::RetryWait
        )
    }

    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pushing => "pushing",
            SyncState::Pulling => "pulling",
            SyncState::Reconciling => "reconciling",
            SyncState::RetryWait => "retry_wait",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters kept per site since the engine started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Runs that finished without error.
    pub runs_completed: u64,
    /// Runs that ended with an error.
    pub runs_failed: u64,
    /// Runs skipped because the lease was held.
    pub runs_skipped: u64,
    /// Records the peer accepted.
    pub records_pushed: u64,
    /// Records applied from the peer, duplicates excluded.
    pub records_pulled: u64,
    /// Conflicts reported in either direction.
    pub conflicts: u64,
    /// Transport retries.
    pub retries: u64,
    /// End of the last successful run.
    pub last_success: Option<DateTime<Utc>>,
    /// Error of the last failed run, cleared by a success.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::RetryWait.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Error.is_active());
        assert_eq!(SyncState::RetryWait.to_string(), "retry_wait");
    }
}
