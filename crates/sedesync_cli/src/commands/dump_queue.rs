//! Dump-queue command implementation.

use crate::commands::emit;
use crate::error::CliResult;
use sedesync_core::SiteNode;
use sedesync_protocol::{ChangeRecord, RecordStatus};
use serde::Serialize;
use std::path::Path;

/// Change record summary for output.
#[derive(Debug, Serialize)]
pub struct QueueEntry {
    /// Local sequence.
    pub sequence: u64,
    /// Sequence at the origin site.
    pub origin_sequence: u64,
    /// Origin site.
    pub site_id: String,
    /// Entity table.
    pub table: String,
    /// Record identifier.
    pub global_id: String,
    /// CREATE, UPDATE or DELETE.
    pub operation: String,
    /// Queue status.
    pub status: String,
    /// Failure detail, for FAILED records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Conflict the record is held behind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<String>,
    /// Conflict the record resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolves: Option<String>,
    /// Last status change.
    pub updated_at: String,
}

impl From<&ChangeRecord> for QueueEntry {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            sequence: record.sequence,
            origin_sequence: record.origin_sequence,
            site_id: record.site_id.to_string(),
            table: record.table.clone(),
            global_id: record.global_id.to_string(),
            operation: record.operation.to_string(),
            status: record.status.to_string(),
            error: record.error_detail.clone(),
            conflict: record.conflict.map(|c| c.to_string()),
            resolves: record.resolves.map(|c| c.to_string()),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// Runs the dump-queue command.
pub fn run(path: &Path, status: Option<&str>, limit: usize, format: &str) -> CliResult<()> {
    let status: Option<RecordStatus> = status.map(str::parse).transpose()?;
    let node = SiteNode::open_existing(path)?;
    let entries: Vec<QueueEntry> = node
        .changes()
        .records(status, limit)?
        .iter()
        .map(QueueEntry::from)
        .collect();

    emit(format, &entries, |entries| print_text_output(entries))
}

fn print_text_output(entries: &[QueueEntry]) {
    println!("Change records ({} shown)", entries.len());
    println!("================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] {:7} {:6} {}/{}",
            entry.sequence,
            entry.status,
            entry.operation,
            entry.table,
            &entry.global_id[..8.min(entry.global_id.len())]
        );
        if entry.origin_sequence != entry.sequence {
            print!(" origin={}@{}", entry.origin_sequence, &entry.site_id[..8]);
        }
        if let Some(ref conflict) = entry.conflict {
            print!(" held={}", &conflict[..8]);
        }
        if let Some(ref resolves) = entry.resolves {
            print!(" resolves={}", &resolves[..8]);
        }
        if let Some(ref error) = entry.error {
            print!(" error=\"{error}\"");
        }
        println!();
    }
}
