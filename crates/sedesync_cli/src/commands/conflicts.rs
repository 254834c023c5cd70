//! Conflict listing and resolution commands.

use crate::commands::emit;
use crate::error::{CliError, CliResult};
use crate::session::Session;
use sedesync_engine::SyncConfig;
use sedesync_protocol::{ConflictDecision, ConflictEntry, ConflictId, Snapshot};
use std::path::Path;

/// Runs the conflicts command.
pub fn list(path: &Path, format: &str) -> CliResult<()> {
    let session = Session::open(path, None, SyncConfig::default())?;
    let entries = session.engine.conflicts(session.site())?;
    emit(format, &entries, |entries| print_entries(entries))
}

/// Runs the resolve-conflict command.
pub fn resolve(
    path: &Path,
    id: &str,
    decision: &str,
    merged: Option<&str>,
    format: &str,
) -> CliResult<()> {
    let id: ConflictId = id.parse()?;
    let merged = merged
        .map(serde_json::from_str::<Snapshot>)
        .transpose()
        .map_err(|e| CliError::InvalidArgument(format!("merged payload: {e}")))?;
    let decision = ConflictDecision::parse(decision, merged)?;

    let session = Session::open(path, None, SyncConfig::default())?;
    let resolution = session
        .engine
        .resolve_conflict(session.site(), id, &decision)?;

    emit(format, &resolution, |resolution| {
        println!(
            "Resolved {} with {} (record {})",
            resolution.conflict_id, resolution.decision, resolution.record.sequence
        );
        if !resolution.superseded.is_empty() {
            println!("  superseded local records: {:?}", resolution.superseded);
        }
        if let Some(ref published) = resolution.published {
            println!("  queued for the hub as record {}", published.sequence);
        }
    })
}

fn print_entries(entries: &[ConflictEntry]) {
    println!("Open conflicts ({} total)", entries.len());
    println!("================");
    for entry in entries {
        println!();
        println!("{}  {}/{}", entry.id, entry.table, entry.global_id);
        println!(
            "  detected on {} at {}",
            entry.detected_on, entry.detected_at
        );
        println!(
            "  local:  {} from {} (seq {})",
            entry.local.operation, entry.local.site_id, entry.local.origin_sequence
        );
        let remote = entry.latest_remote();
        println!(
            "  remote: {} from {} (seq {})",
            remote.operation, remote.site_id, remote.origin_sequence
        );
        let fields = entry.differing_fields();
        if !fields.is_empty() {
            println!("  differing fields: {}", fields.join(", "));
        }
        if !entry.held.is_empty() {
            println!("  held changes: {}", entry.held.len());
        }
    }
}
