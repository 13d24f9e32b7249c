//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod run;
mod targets;
mod validate;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build the matrix and publish succeeded targets
    Run(run::RunArgs),
    /// List the targets of a matrix
    Targets {
        /// Path to the matrix file
        #[arg(short, long, default_value = "matrix.lua")]
        matrix: PathBuf,
    },
    /// Parse and validate a matrix without running it
    Validate {
        /// Path to the matrix file
        #[arg(short, long, default_value = "matrix.lua")]
        matrix: PathBuf,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, verbose: bool) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run(args, verbose).await,
        Commands::Targets { matrix } => targets::list_targets(&matrix),
        Commands::Validate { matrix } => validate::validate(&matrix),
    }
}
