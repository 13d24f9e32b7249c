//! Configuration module
//!
//! Layers command-line flags over the environment-derived runner
//! configuration.

use anyhow::{Context, Result};
use kiln_runner::Config;
use std::path::PathBuf;
use std::time::Duration;

/// Flags that override the runner configuration when given
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub concurrency: Option<usize>,
    pub work_dir: Option<PathBuf>,
    pub runtime: Option<String>,
    pub stage_timeout: Option<u64>,
    pub store: Option<String>,
    pub no_publish: bool,
}

/// Builds and validates the runner configuration for a matrix run
pub fn load(overrides: Overrides) -> Result<Config> {
    let config = apply(Config::from_env()?, overrides);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply(mut config: Config, overrides: Overrides) -> Config {
    if let Some(concurrency) = overrides.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(work_dir) = overrides.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(runtime) = overrides.runtime {
        config.container_runtime = runtime;
    }
    if let Some(secs) = overrides.stage_timeout {
        config.stage_timeout = Duration::from_secs(secs);
    }
    if overrides.store.is_some() {
        config.store_url = overrides.store;
    }
    config.publish = !overrides.no_publish;
    config
}
