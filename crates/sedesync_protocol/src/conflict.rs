//! Conflict entries and resolution decisions.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ConflictId, GlobalId, SiteId};
use crate::payload::Snapshot;
use crate::record::{ChangeRecord, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction in which a record arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Pushed to this node by a peer.
    Push,
    /// Pulled by this node from a peer.
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}

/// Two divergent edits of one record awaiting an operator decision.
///
/// Neither side has been written over the other. `local` is the change
/// this node already had; `remote` is the incoming change that disagreed
/// with it. Later incoming changes to the same record are kept in `held`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Registry identifier.
    pub id: ConflictId,
    /// Site whose node holds the entry.
    pub home_site: SiteId,
    /// Entity table.
    pub table: String,
    /// Record identifier.
    pub global_id: GlobalId,
    /// The change already present at this node.
    pub local: ChangeRecord,
    /// The incoming change that disagreed.
    pub remote: ChangeRecord,
    /// Later incoming changes to the same record.
    pub held: Vec<ChangeRecord>,
    /// How the remote change arrived.
    pub detected_on: Direction,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

impl ConflictEntry {
    /// The most recent change on the remote side.
    pub fn latest_remote(&self) -> &ChangeRecord {
        self.held.last().unwrap_or(&self.remote)
    }

    /// Field names whose values differ between the two sides.
    ///
    /// When one side is a DELETE every field of the other side differs.
    pub fn differing_fields(&self) -> Vec<String> {
        let empty = Snapshot::new();
        let local = self.local.payload.as_ref().unwrap_or(&empty);
        let remote = self.latest_remote().payload.as_ref().unwrap_or(&empty);
        local.differing_fields(remote)
    }
}

/// Operator decision for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictDecision {
    /// The change already present at the node wins.
    KeepLocal,
    /// The incoming change wins.
    KeepRemote,
    /// An operator supplied payload replaces both sides.
    Merged(Snapshot),
}

impl ConflictDecision {
    /// Parses a decision name. `merged` requires a payload.
    pub fn parse(name: &str, merged: Option<Snapshot>) -> ProtocolResult<Self> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "keep-local" | "keeplocal" | "local" => Ok(ConflictDecision::KeepLocal),
            "keep-remote" | "keepremote" | "remote" => Ok(ConflictDecision::KeepRemote),
            "merged" | "merge" | "merged-payload" | "mergedpayload" => merged
                .map(ConflictDecision::Merged)
                .ok_or_else(|| ProtocolError::UnknownDecision("merged without payload".into())),
            other => Err(ProtocolError::UnknownDecision(other.to_string())),
        }
    }

    /// Winning operation and payload for the given entry.
    pub fn winner(&self, entry: &ConflictEntry) -> (Operation, Option<Snapshot>) {
        match self {
            ConflictDecision::KeepLocal => (entry.local.operation, entry.local.payload.clone()),
            ConflictDecision::KeepRemote => {
                let remote = entry.latest_remote();
                (remote.operation, remote.payload.clone())
            }
            ConflictDecision::Merged(payload) => (Operation::Update, Some(payload.clone())),
        }
    }

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictDecision::KeepLocal => "keep-local",
            ConflictDecision::KeepRemote => "keep-remote",
            ConflictDecision::Merged(_) => "merged",
        }
    }
}
