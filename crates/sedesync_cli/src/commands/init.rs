//! Init command implementation.

use crate::commands::emit;
use crate::error::CliResult;
use sedesync_core::SiteNode;
use sedesync_protocol::{Site, SiteCode};
use std::path::Path;

/// Runs the init command.
pub fn run(path: &Path, code: &str, name: &str, format: &str) -> CliResult<()> {
    let code: SiteCode = code.parse()?;
    let node = SiteNode::open(path, Site::new(code, name))?;

    emit(format, node.site(), |site| {
        println!("Provisioned site {} ({})", site.code, site.name);
        println!("  id:   {}", site.id);
        println!("  path: {}", path.display());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_then_reopen() {
        let dir = TempDir::new().unwrap();
        run(dir.path(), "norte", "Sede Norte", "json").unwrap();

        let node = SiteNode::open_existing(dir.path()).unwrap();
        assert_eq!(node.site().code, SiteCode::Norte);
        assert_eq!(node.site().name, "Sede Norte");
    }

    #[test]
    fn unknown_code_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(run(dir.path(), "antartida", "?", "text").is_err());
    }
}
