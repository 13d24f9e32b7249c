//! Matrix validation command

use anyhow::Result;
use colored::*;
use std::path::Path;

pub fn validate(matrix: &Path) -> Result<()> {
    let targets = kiln_lua::parse_matrix_file(matrix)?;

    println!(
        "{}",
        format!("✓ {} is valid ({} target(s))", matrix.display(), targets.len())
            .green()
            .bold()
    );
    Ok(())
}
