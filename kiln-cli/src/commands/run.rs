//! Matrix run command
//!
//! Runs every selected target, prints a per-target summary and fails when
//! any target did not succeed.

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::*;
use kiln_core::domain::log::LogLevel;
use kiln_core::domain::run::PipelineRun;
use kiln_core::domain::stage::StageResult;
use kiln_runner::environment::check_runtime_available;
use kiln_runner::{
    ContainerProvider, Coordinator, HostProvider, MatrixReport, ModeProvider, PipelineSettings,
    TargetReport, TargetStatus, open_store, select_targets,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{self, Overrides};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the matrix file
    #[arg(short, long, default_value = "matrix.lua")]
    matrix: PathBuf,

    /// Source checkout to build
    #[arg(short, long, default_value = ".")]
    source: PathBuf,

    /// Only run these targets (repeatable)
    #[arg(long = "only", value_name = "TAG")]
    only: Vec<String>,

    /// Maximum number of simultaneously active environments
    #[arg(short, long, env = "KILN_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Artifact store URL (file:///path or gs://bucket/prefix)
    #[arg(long, env = "KILN_STORE_URL")]
    store: Option<String>,

    /// Directory for per-target staging directories
    #[arg(long, env = "KILN_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Container runtime (podman or docker)
    #[arg(long, env = "KILN_CONTAINER_RUNTIME")]
    runtime: Option<String>,

    /// Timeout for every command, in seconds
    #[arg(long, env = "KILN_STAGE_TIMEOUT")]
    stage_timeout: Option<u64>,

    /// Build without publishing
    #[arg(long)]
    no_publish: bool,

    /// Write the full matrix report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

pub async fn handle_run(args: RunArgs, verbose: bool) -> Result<()> {
    let targets = kiln_lua::parse_matrix_file(&args.matrix)?;
    let targets = select_targets(targets, &args.only)?;

    let config = config::load(Overrides {
        concurrency: args.concurrency,
        work_dir: args.work_dir,
        runtime: args.runtime,
        stage_timeout: args.stage_timeout,
        store: args.store,
        no_publish: args.no_publish,
    })?;

    // Container targets fail on their own when the runtime is missing
    if targets.iter().any(|t| t.container().is_some()) {
        if let Err(e) = check_runtime_available(&config.container_runtime).await {
            warn!("{}", e);
        }
    }

    let provider = ModeProvider::new(
        HostProvider::new(),
        ContainerProvider::new(config.container_runtime.clone()),
    );
    let settings = PipelineSettings {
        work_dir: config.work_dir.clone(),
        source_dir: args.source,
        stage_timeout: config.stage_timeout,
    };

    let mut coordinator = Coordinator::new(Arc::new(provider), settings, config.concurrency);
    if let Some(url) = &config.store_url {
        let store = open_store(url).with_context(|| format!("Failed to open store {}", url))?;
        coordinator = coordinator.with_store(store);
    }
    let coordinator = coordinator.with_publishing(config.publish);

    info!(
        "Running {} from {}",
        targets
            .iter()
            .map(|t| t.tag.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        args.matrix.display()
    );

    let report = coordinator.run(targets).await;
    print_report(&report, verbose);

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    if !report.succeeded() {
        bail!(
            "{} target(s) did not succeed: {}",
            report.failed_tags().len(),
            report.failed_tags().join(", ")
        );
    }
    Ok(())
}

fn print_report(report: &MatrixReport, verbose: bool) {
    println!();
    println!("{}", "Matrix summary:".bold());
    for target in &report.targets {
        print_target(target);
        if verbose {
            print_log(&target.run);
        }
    }

    for target in report
        .targets
        .iter()
        .filter(|t| t.status != TargetStatus::Succeeded)
    {
        print_failure(target);
    }

    println!();
    if report.succeeded() {
        println!("{}", "✓ All targets succeeded".green().bold());
    } else {
        println!(
            "{}",
            format!("✗ Failed: {}", report.failed_tags().join(", "))
                .red()
                .bold()
        );
    }
}

fn status_label(status: TargetStatus) -> ColoredString {
    match status {
        TargetStatus::Succeeded => status.to_string().green().bold(),
        TargetStatus::Failed => status.to_string().red().bold(),
        TargetStatus::PreconditionFailed | TargetStatus::PublishFailed => {
            status.to_string().yellow().bold()
        }
    }
}

fn print_target(target: &TargetReport) {
    let duration = target
        .run
        .duration_ms()
        .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!(
        "  {} {} {} {}",
        "▸".cyan(),
        target.tag.bold(),
        status_label(target.status),
        duration.dimmed()
    );

    for stage in &target.run.stages {
        print_stage(stage);
    }
    for name in &target.run.skipped {
        println!("    {} {} {}", "-".dimmed(), name.dimmed(), "skipped".dimmed());
    }

    if let Some(record) = &target.publication {
        println!(
            "    {} {} ({} object(s), checksum {})",
            "→".green(),
            record.remote_path,
            record.objects.len(),
            &record.checksum[..record.checksum.len().min(12)]
        );
    }
    if let Some(error) = &target.publish_error {
        println!("    {} {}", "publish:".yellow(), error);
    }
}

fn print_stage(stage: &StageResult) {
    if stage.passed() {
        println!(
            "    {} {} {}",
            "✓".green(),
            stage.stage_name,
            format!("{}ms", stage.duration_ms).dimmed()
        );
    } else {
        let reason = stage
            .error
            .clone()
            .unwrap_or_else(|| format!("exit code {}", stage.exit_code));
        println!("    {} {} {}", "✗".red(), stage.stage_name, reason.red());
    }
}

/// Output of the first failing stage, or the reason no stage ran
fn print_failure(target: &TargetReport) {
    println!();
    println!("{}", format!("── {} ──", target.tag).red().bold());

    match target.run.first_failure() {
        Some(stage) => {
            println!("{} {}", "Stage:".bold(), stage.stage_name);
            if !stage.stdout.trim().is_empty() {
                println!("{}", "stdout:".bold());
                println!("{}", stage.stdout.trim_end());
            }
            if !stage.stderr.trim().is_empty() {
                println!("{}", "stderr:".bold());
                println!("{}", stage.stderr.trim_end());
            }
            if let Some(error) = &stage.error {
                println!("{} {}", "error:".bold(), error);
            }
        }
        None => {
            if let Some(error) = target.run.error.as_ref().or(target.publish_error.as_ref()) {
                println!("{}", error);
            }
        }
    }
}

fn print_log(run: &PipelineRun) {
    for entry in &run.log {
        let level = match entry.level {
            LogLevel::Debug => entry.level.to_string().dimmed(),
            LogLevel::Info => entry.level.to_string().normal(),
            LogLevel::Warning => entry.level.to_string().yellow(),
            LogLevel::Error => entry.level.to_string().red(),
        };
        println!(
            "      {} {} {}",
            entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
            level,
            entry.message
        );
    }
}
