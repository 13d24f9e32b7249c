//! Error kinds for Kiln
//!
//! Every error is local to one target pipeline. None of them is retried;
//! the pipeline that hits one ends and reports it.

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::run::RunStatus;

/// The environment for a target could not be created
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("container runtime '{runtime}' is not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    #[error("failed to create environment for {tag}: exit_code={exit_code}, stderr='{stderr}'")]
    CreateFailed {
        tag: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("variable {name} required by {tag} is not set on the host")]
    MissingVariable { tag: String, name: String },

    #[error("'{tag}' cannot be used as a directory name")]
    InvalidTag { tag: String },

    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("setup command '{command}' for {tag} exited with {exit_code}: {stderr}")]
    Setup {
        tag: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("setup for {tag} could not run: {source}")]
    SetupExec {
        tag: String,
        #[source]
        source: ExecutionError,
    },
}

/// A command could not be run to completion
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("unknown variable ${{{name}}} in '{template}'")]
    UnknownVariable { name: String, template: String },

    #[error("unterminated placeholder in '{template}'")]
    MalformedTemplate { template: String },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("environment {env} is not running")]
    Unreachable { env: String },

    #[error("stage {stage} produced no file matching '{pattern}'")]
    MissingArtifact { stage: String, pattern: String },

    #[error("invalid artifact pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

impl ExecutionError {
    /// Exit code recorded for a stage that ended on this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::Timeout { .. } => 124,
            _ => -1,
        }
    }
}

/// An upstream artifact required before building was unavailable
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("{tag} requires {dependency}, which ended {status}")]
    DependencyFailed {
        tag: String,
        dependency: String,
        status: String,
    },

    #[error("{tag} requires published artifacts but no store is configured")]
    NoStore { tag: String },

    #[error("{tag} requires artifacts of {dependency}, but none are published")]
    NotPublished { tag: String, dependency: String },

    #[error("failed to fetch artifacts of {dependency} for {tag}: {source}")]
    Fetch {
        tag: String,
        dependency: String,
        #[source]
        source: StoreError,
    },
}

/// Upload or verification failed after a successful build
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("refusing to publish {tag}: {reason}")]
    NotEligible { tag: String, reason: String },

    #[error("refusing to publish {tag}: no artifacts were staged")]
    NoArtifacts { tag: String },

    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to upload artifacts of {tag}: {source}")]
    Upload {
        tag: String,
        #[source]
        source: StoreError,
    },

    #[error("verification of {object} failed: expected {expected}, found {actual}")]
    Verification {
        object: String,
        expected: String,
        actual: String,
    },

    #[error("failed to promote artifacts of {tag}: {source}")]
    Promote {
        tag: String,
        #[source]
        source: StoreError,
    },
}

/// Remote artifact store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store url '{0}'")]
    InvalidUrl(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("unexpected store output: {0}")]
    Parse(String),
}

/// A pipeline run was asked to move to a status it cannot reach
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("run for {tag} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub tag: String,
    pub from: RunStatus,
    pub to: RunStatus,
}
