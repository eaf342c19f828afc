//! Writes the default configuration set to a directory.

use anyhow::Result;
use std::path::Path;

use crate::defaults::{self, Materialized};
use crate::style::{self, colors::SemanticStyle};

pub fn run(dir: &Path) -> Result<()> {
    match defaults::materialize(dir)? {
        Materialized::Written(count) => style::print_success(&format!(
            "Wrote {count} default config files to {}",
            dir.display().code()
        )),
        Materialized::Kept => style::print_warn(&format!(
            "{} is not empty; left untouched",
            dir.display().code()
        )),
    }
    Ok(())
}
