//! Matrix run configuration
//!
//! Defines the configurable parameters of a matrix run: concurrency,
//! working directory, container runtime, command timeout and the artifact
//! store to publish to.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::open_store;

/// Container runtimes sharing the CLI surface the container provider uses
pub const SUPPORTED_RUNTIMES: &[&str] = &["podman", "docker"];

/// Matrix run configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of simultaneously active environments
    pub concurrency: usize,

    /// Directory holding per-target staging directories
    pub work_dir: PathBuf,

    /// Container runtime binary (podman or docker)
    pub container_runtime: String,

    /// Maximum time any single command may run
    pub stage_timeout: Duration,

    /// Artifact store URL (`file:///path` or `gs://bucket/prefix`)
    pub store_url: Option<String>,

    /// Whether succeeded targets are published
    pub publish: bool,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            concurrency: 2,
            work_dir: std::env::temp_dir().join("kiln"),
            container_runtime: "podman".to_string(),
            stage_timeout: Duration::from_secs(3600), // 1 hour
            store_url: None,
            publish: true,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - KILN_CONCURRENCY (default: 2)
    /// - KILN_WORK_DIR (default: <tmp>/kiln)
    /// - KILN_CONTAINER_RUNTIME (default: podman)
    /// - KILN_STAGE_TIMEOUT (seconds, default: 3600)
    /// - KILN_STORE_URL
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::new();

        if let Ok(value) = std::env::var("KILN_CONCURRENCY") {
            config.concurrency = value
                .parse()
                .map_err(|_| anyhow::anyhow!("KILN_CONCURRENCY must be a number, got '{}'", value))?;
        }

        if let Ok(value) = std::env::var("KILN_WORK_DIR") {
            config.work_dir = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("KILN_CONTAINER_RUNTIME") {
            config.container_runtime = value;
        }

        if let Ok(value) = std::env::var("KILN_STAGE_TIMEOUT") {
            let secs: u64 = value.parse().map_err(|_| {
                anyhow::anyhow!("KILN_STAGE_TIMEOUT must be a number of seconds, got '{}'", value)
            })?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        config.store_url = std::env::var("KILN_STORE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.stage_timeout.as_secs() == 0 {
            anyhow::bail!("stage_timeout must be greater than 0");
        }

        if !SUPPORTED_RUNTIMES.contains(&self.container_runtime.as_str()) {
            anyhow::bail!(
                "container_runtime must be one of {}, got '{}'",
                SUPPORTED_RUNTIMES.join(", "),
                self.container_runtime
            );
        }

        match &self.store_url {
            Some(url) => {
                open_store(url)?;
            }
            None if self.publish => {
                anyhow::bail!("a store url is required unless publishing is disabled");
            }
            None => {}
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
