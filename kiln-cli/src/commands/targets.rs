//! Target listing command

use anyhow::Result;
use colored::*;
use kiln_core::domain::target::Target;
use std::path::Path;

pub fn list_targets(matrix: &Path) -> Result<()> {
    let targets = kiln_lua::parse_matrix_file(matrix)?;

    println!("{}", format!("Found {} target(s):", targets.len()).bold());
    println!();
    for target in &targets {
        print_target(target);
    }
    Ok(())
}

fn print_target(target: &Target) {
    println!("  {} {}", "▸".cyan(), target.tag.bold());
    println!("    Platform: {}", target.describe().dimmed());
    if let Some(container) = target.container() {
        println!("    Image:    {}", container.image.dimmed());
    }
    println!("    Stages:   {}", target.stage_names().join(" → ").dimmed());
    if !target.setup.is_empty() {
        println!("    Setup:    {} command(s)", target.setup.len());
    }
    if !target.requires.is_empty() {
        let requires: Vec<String> = target
            .requires
            .iter()
            .map(|p| format!("{} → {}", p.tag, p.dest))
            .collect();
        println!("    Requires: {}", requires.join(", ").yellow());
    }
    if !target.passthrough.is_empty() {
        println!("    Secrets:  {}", target.passthrough.join(", ").dimmed());
    }
    println!();
}
