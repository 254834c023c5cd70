//! Cleanup command implementation.

use crate::commands::emit;
use crate::error::CliResult;
use crate::session::Session;
use sedesync_engine::SyncConfig;
use std::path::Path;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runs the cleanup command.
pub fn run(path: &Path, retention_days: u64, format: &str) -> CliResult<()> {
    let session = Session::open(path, None, SyncConfig::default())?;
    let retention = Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY));
    let report = session.engine.cleanup(session.site(), retention)?;

    emit(format, &report, |report| {
        println!(
            "Deleted {} SYNCED record(s) last updated before {}",
            report.deleted, report.cutoff
        );
    })
}
