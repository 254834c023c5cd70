//! Push, pull, full-sync and retry-failed commands.
//!
//! Each opens the hub's data directory in-process and talks to it through
//! the loopback transport.

use crate::commands::emit;
use crate::error::CliResult;
use crate::session::Session;
use sedesync_engine::{FullSyncPolicy, PullReport, PushReport, SyncConfig};
use sedesync_protocol::ApplyOutcome;
use std::path::Path;

/// Runs the push command.
pub fn push(path: &Path, hub: Option<&Path>, format: &str) -> CliResult<()> {
    let session = Session::with_hub(path, hub, SyncConfig::default(), "push")?;
    let report = session.engine.push(session.site())?;
    emit(format, &report, |report| print_push(report))
}

/// Runs the pull command.
pub fn pull(
    path: &Path,
    hub: Option<&Path>,
    tables: Option<Vec<String>>,
    since: Option<u64>,
    format: &str,
) -> CliResult<()> {
    let session = Session::with_hub(path, hub, SyncConfig::default(), "pull")?;
    let report = match since {
        Some(since) => session.engine.pull_since(session.site(), since, tables)?,
        None => session.engine.pull(session.site(), tables)?,
    };
    emit(format, &report, |report| print_pull(report))
}

/// Runs the full-sync command.
pub fn full_sync(
    path: &Path,
    hub: Option<&Path>,
    tables: Option<Vec<String>>,
    remove_missing: bool,
    format: &str,
) -> CliResult<()> {
    let policy = if remove_missing {
        FullSyncPolicy::removing_missing()
    } else {
        FullSyncPolicy::default()
    };
    let config = SyncConfig::default().with_full_sync(policy);
    let session = Session::with_hub(path, hub, config, "full-sync")?;
    let report = session.engine.full_sync(session.site(), tables)?;

    emit(format, &report, |report| {
        println!("Full sync at hub cursor {}", report.cursor);
        println!("================");
        for table in &report.tables {
            println!(
                "{:20} total={} inserted={} updated={} unchanged={} removed={} failed={}",
                table.table,
                table.total,
                table.inserted,
                table.updated,
                table.unchanged,
                table.removed,
                table.failed
            );
            for error in &table.errors {
                println!("    {} {}", error.global_id, error.reason);
            }
        }
        if report.cursor_reset {
            println!("Watermark reset to {}", report.cursor);
        }
    })
}

/// Runs the retry-failed command.
pub fn retry_failed(path: &Path, hub: Option<&Path>, format: &str) -> CliResult<()> {
    let session = Session::with_hub(path, hub, SyncConfig::default(), "retry-failed")?;
    let report = session.engine.retry_failed(session.site())?;

    emit(format, &report, |report| {
        println!("Requeued {} FAILED record(s)", report.requeued.len());
        print_push(&report.push);
    })
}

fn print_push(report: &PushReport) {
    println!(
        "Pushed {} record(s) in {} batch(es): {} synced, {} conflict, {} failed",
        report.attempted(),
        report.batches,
        report.synced,
        report.conflicts,
        report.failed
    );
    for outcome in &report.outcomes {
        match &outcome.outcome {
            ApplyOutcome::Applied { .. } => {}
            ApplyOutcome::Conflict { conflict_id, .. } => {
                println!("  [{:08}] held behind {}", outcome.sequence, conflict_id);
            }
            ApplyOutcome::Rejected { reason } => {
                println!("  [{:08}] failed: {}", outcome.sequence, reason);
            }
        }
    }
}

fn print_pull(report: &PullReport) {
    println!(
        "Pulled {} record(s) in {} page(s): {} applied, {} duplicate, {} conflict, {} failed",
        report.received,
        report.pages,
        report.applied,
        report.duplicates,
        report.conflicts,
        report.failed
    );
    for failure in &report.failures {
        println!(
            "  {} {}/{}: {}",
            failure.origin, failure.table, failure.global_id, failure.reason
        );
    }
    if report.cursor_saved {
        println!("Watermark now {}", report.cursor);
    } else {
        println!("Reached cursor {} (watermark unchanged)", report.cursor);
    }
}
