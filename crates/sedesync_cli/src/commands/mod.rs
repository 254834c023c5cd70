//! CLI command implementations.

pub mod cleanup;
pub mod conflicts;
pub mod dump_queue;
pub mod init;
pub mod status;
pub mod sync;

use crate::error::CliResult;
use serde::Serialize;

/// Prints `value` as pretty JSON, or as text through `text`.
pub(crate) fn emit<T: Serialize>(format: &str, value: &T, text: impl FnOnce(&T)) -> CliResult<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        _ => text(value),
    }
    Ok(())
}
