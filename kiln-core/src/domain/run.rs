//! Pipeline run domain types
//!
//! A pipeline run is the record of one target's stage execution attempt.
//! It lives in memory for the duration of one matrix invocation and moves
//! to a terminal status exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::log::{LogEntry, LogLevel};
use crate::domain::stage::StageResult;
use crate::domain::target::Target;
use crate::error::TransitionError;

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// An upstream artifact required before building was unavailable
    PreconditionFailed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::PreconditionFailed
        )
    }

    fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::PreconditionFailed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::PreconditionFailed => write!(f, "precondition-failed"),
        }
    }
}

/// Record of one target's pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub tag: String,
    /// Stage definition names of the target, in declaration order
    pub planned: Vec<String>,
    status: RunStatus,
    /// Stage results in execution order
    pub stages: Vec<StageResult>,
    /// Stages never executed because an earlier one failed
    pub skipped: Vec<String>,
    /// Staged artifact set (host paths, sorted, deduplicated)
    pub artifacts: Vec<PathBuf>,
    /// Host directory the artifacts were staged in
    pub staging_dir: Option<PathBuf>,
    /// Provisioning or precondition error, if the run ended on one
    pub error: Option<String>,
    pub log: Vec<LogEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a pending run for a target
    pub fn new(target: &Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag: target.tag.clone(),
            planned: target.stages.iter().map(|s| s.name.clone()).collect(),
            status: RunStatus::Pending,
            stages: Vec::new(),
            skipped: Vec::new(),
            artifacts: Vec::new(),
            staging_dir: None,
            error: None,
            log: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                tag: self.tag.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks the run as running
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Moves the run to a terminal status
    pub fn finish(&mut self, status: RunStatus) -> Result<(), TransitionError> {
        self.transition(status)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Appends a stage result and collects its artifacts
    pub fn record(&mut self, result: StageResult) {
        for path in &result.artifacts {
            if !self.artifacts.contains(path) {
                self.artifacts.push(path.clone());
            }
        }
        self.artifacts.sort();
        self.stages.push(result);
    }

    /// Adds an entry to the run's transcript
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry::now(level, message));
    }

    /// First failing stage, if any
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| !s.passed())
    }

    /// Whether every planned stage ran, in order, and passed
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Succeeded
            && self.stages.len() == self.planned.len()
            && self
                .stages
                .iter()
                .zip(&self.planned)
                .all(|(result, name)| result.stage_name == *name && result.passed())
    }

    /// Wall-clock duration of the run, if it finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
