//! Status command implementation.

use crate::commands::emit;
use crate::error::CliResult;
use crate::session::Session;
use sedesync_engine::{StatusReport, SyncConfig};
use std::path::Path;

/// Runs the status command.
pub fn run(path: &Path, hub: Option<&Path>, format: &str) -> CliResult<()> {
    let session = Session::open(path, hub, SyncConfig::default())?;
    let report = session.engine.status(session.site())?;
    emit(format, &report, |report| print_text(report, hub.is_some()))
}

fn print_text(report: &StatusReport, with_hub: bool) {
    let counts = &report.counts;
    println!("Site {}", report.site);
    println!("================");
    println!("State:            {}", report.state);
    println!("Pending:          {}", counts.pending);
    println!("  held (conflict) {}", counts.flagged);
    println!("Synced:           {}", counts.synced);
    println!("Failed:           {}", counts.failed);
    println!("Replicas:         {}", counts.replicas);
    println!("Open conflicts:   {}", report.open_conflicts);
    if with_hub {
        println!("Hub cursor:       {}", report.cursor);
    }
    if report.capture_warnings > 0 {
        println!();
        println!(
            "WARNING: {} change(s) could not be captured; synchronization is degraded",
            report.capture_warnings
        );
    }
    if let Some(at) = report.stats.last_success {
        println!("Last success:     {at}");
    }
    if let Some(ref error) = report.stats.last_error {
        println!("Last error:       {error}");
    }
}
