//! Kiln CLI
//!
//! Builds every target of a build matrix in its own environment and
//! publishes the artifacts of the targets that succeed.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Cross-platform build matrix runner", long_about = None)]
struct Cli {
    /// Log at debug level and print every target's run log
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Log filter used when `RUST_LOG` is unset
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "kiln=debug,kiln_runner=debug,kiln_lua=debug"
    } else {
        "kiln=info,kiln_runner=info,kiln_lua=info"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(cli.verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    handle_command(cli.command, cli.verbose).await
}
