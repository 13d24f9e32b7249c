//! Stage definitions and results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::target::UnknownValue;

/// Identity a command runs as inside its environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageUser {
    /// The unprivileged build user
    #[default]
    Build,
    /// root, for system-level package installation
    Root,
}

impl fmt::Display for StageUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageUser::Build => write!(f, "build"),
            StageUser::Root => write!(f, "root"),
        }
    }
}

impl FromStr for StageUser {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(StageUser::Build),
            "root" => Ok(StageUser::Root),
            other => Err(UnknownValue {
                field: "user",
                value: other.to_string(),
                expected: "build, root",
            }),
        }
    }
}

/// A named unit of work in a target's pipeline
///
/// Failure of any stage is fatal to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Command template; `${VAR}` placeholders are expanded before execution
    pub command: Vec<String>,
    pub user: StageUser,
    /// Glob patterns, relative to the staging directory, the stage must produce
    pub artifacts: Vec<String>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            user: StageUser::Build,
            artifacts: Vec::new(),
        }
    }

    pub fn as_root(mut self) -> Self {
        self.user = StageUser::Root;
        self
    }

    pub fn with_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.artifacts.push(pattern.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// Outcome of one stage execution; immutable once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub status: StageStatus,
    /// Exit code (0 = success, -1 = could not run, 124 = timed out)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Artifact files captured after the stage, as host paths
    pub artifacts: Vec<PathBuf>,
    pub duration_ms: u64,
    /// Why the stage failed when the exit code alone does not say
    pub error: Option<String>,
}

impl StageResult {
    /// Whether this stage passed (exit code 0 and no capture error)
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Succeeded && self.exit_code == 0
    }
}
