//! Target pipeline engine
//!
//! Runs one target's stages strictly in declaration order on one
//! environment instance. The first failing stage ends the pipeline; the
//! remaining stages are recorded as skipped. The environment is destroyed
//! on every exit path once it has been created.

use kiln_core::domain::log::LogLevel;
use kiln_core::domain::run::{PipelineRun, RunStatus};
use kiln_core::domain::stage::{StageDefinition, StageResult, StageStatus};
use kiln_core::domain::target::Target;
use kiln_core::error::{ExecutionError, PreconditionError, ProvisionError, TransitionError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::command::CommandRenderer;
use crate::environment::{Environment, EnvironmentProvider, ExecRequest};
use crate::publisher::MANIFEST_NAME;
use crate::store::{ArtifactStore, join_key};
use crate::workspace::Workspace;

/// Settings shared by every pipeline of a matrix run
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Directory holding the per-target staging directories
    pub work_dir: PathBuf,
    /// Source checkout shared by all targets
    pub source_dir: PathBuf,
    /// Upper bound for every command executed in an environment
    pub stage_timeout: Duration,
}

pub struct TargetPipeline {
    target: Arc<Target>,
    provider: Arc<dyn EnvironmentProvider>,
    store: Option<Arc<dyn ArtifactStore>>,
    settings: PipelineSettings,
}

impl TargetPipeline {
    pub fn new(
        target: Arc<Target>,
        provider: Arc<dyn EnvironmentProvider>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            target,
            provider,
            store: None,
            settings,
        }
    }

    /// Store the target's preconditions are fetched from
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs the pipeline to a terminal status
    pub async fn run(&self) -> PipelineRun {
        let tag = self.target.tag.clone();
        let mut run = PipelineRun::new(&self.target);
        note(&mut run, LogLevel::Info, format!("Starting pipeline for {}", self.target.describe()));

        let workspace =
            match Workspace::prepare(&self.settings.work_dir, &self.settings.source_dir, &tag).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    abort(&mut run, e.to_string());
                    return run;
                }
            };
        run.staging_dir = Some(workspace.staging.clone());

        if let Err(e) = self.fetch_preconditions(&mut run, &workspace).await {
            block(&mut run, &e);
            return run;
        }

        checked(&tag, run.start());

        let mut env = match self.provider.create(&self.target, &workspace).await {
            Ok(env) => env,
            Err(e) => {
                self.fail_provisioning(&mut run, &e);
                return run;
            }
        };
        note(
            &mut run,
            LogLevel::Info,
            format!("Environment {} ({}) is up", env.id(), env.mode()),
        );

        let renderer = CommandRenderer::new(&self.target, env.source_dir(), env.artifact_dir());

        let status = match self.setup(env.as_ref(), &renderer).await {
            Ok(()) => self.run_stages(&mut run, env.as_ref(), &renderer, &workspace.staging).await,
            Err(e) => {
                self.fail_provisioning(&mut run, &e);
                RunStatus::Failed
            }
        };

        env.destroy().await;
        note(&mut run, LogLevel::Debug, format!("Environment {} destroyed", env.id()));

        if run.status() == RunStatus::Running {
            checked(&tag, run.finish(status));
        }
        note(
            &mut run,
            if status == RunStatus::Succeeded {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            format!("Pipeline for {} {}", tag, status),
        );
        run
    }

    /// Run of a target that was never attempted because a precondition failed
    pub fn blocked(target: &Target, error: &PreconditionError) -> PipelineRun {
        let mut run = PipelineRun::new(target);
        block(&mut run, error);
        run
    }

    /// Run of a target whose pipeline could not run to its own end
    pub fn aborted(target: &Target, reason: impl Into<String>) -> PipelineRun {
        let mut run = PipelineRun::new(target);
        abort(&mut run, reason.into());
        run
    }

    fn fail_provisioning(&self, run: &mut PipelineRun, error: &ProvisionError) {
        run.skipped = run.planned.clone();
        note(run, LogLevel::Error, format!("Provisioning failed: {}", error));
        run.error = Some(error.to_string());
        checked(&self.target.tag, run.finish(RunStatus::Failed));
    }

    /// Fetches the published artifacts this target requires
    ///
    /// Runs before the environment exists, so a missing dependency never
    /// costs a container.
    async fn fetch_preconditions(
        &self,
        run: &mut PipelineRun,
        workspace: &Workspace,
    ) -> Result<(), PreconditionError> {
        if self.target.requires.is_empty() {
            return Ok(());
        }

        let tag = &self.target.tag;
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| PreconditionError::NoStore { tag: tag.clone() })?;

        for precondition in &self.target.requires {
            let fetch_err = |source| PreconditionError::Fetch {
                tag: tag.clone(),
                dependency: precondition.tag.clone(),
                source,
            };

            let keys: Vec<String> = store
                .list(&precondition.tag)
                .await
                .map_err(fetch_err)?
                .into_iter()
                .filter(|key| key != MANIFEST_NAME)
                .collect();

            if keys.is_empty() {
                return Err(PreconditionError::NotPublished {
                    tag: tag.clone(),
                    dependency: precondition.tag.clone(),
                });
            }

            let dest = workspace.staging.join(&precondition.dest);
            for key in &keys {
                store
                    .get(&join_key(&[precondition.tag.as_str(), key.as_str()]), &dest.join(key))
                    .await
                    .map_err(fetch_err)?;
            }

            note(
                run,
                LogLevel::Info,
                format!(
                    "Fetched {} artifact(s) of {} into {}",
                    keys.len(),
                    precondition.tag,
                    dest.display()
                ),
            );
        }

        Ok(())
    }

    /// Runs the provisioning-time setup commands
    async fn setup(
        &self,
        env: &dyn Environment,
        renderer: &CommandRenderer,
    ) -> Result<(), ProvisionError> {
        let tag = &self.target.tag;
        for step in &self.target.setup {
            let argv = renderer
                .render("setup", &step.command)
                .map_err(|source| ProvisionError::SetupExec {
                    tag: tag.clone(),
                    source,
                })?;
            let request = ExecRequest {
                argv,
                user: step.user,
                timeout: self.settings.stage_timeout,
            };

            debug!("[{}] setup: {}", tag, request.display());
            let output = env
                .exec(&request)
                .await
                .map_err(|source| ProvisionError::SetupExec {
                    tag: tag.clone(),
                    source,
                })?;

            if !output.success() {
                return Err(ProvisionError::Setup {
                    tag: tag.clone(),
                    command: request.display(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Runs every stage in order, stopping at the first failure
    async fn run_stages(
        &self,
        run: &mut PipelineRun,
        env: &dyn Environment,
        renderer: &CommandRenderer,
        staging: &Path,
    ) -> RunStatus {
        for (index, stage) in self.target.stages.iter().enumerate() {
            note(run, LogLevel::Info, format!("Running stage {}", stage.name));

            let result = self.run_stage(env, renderer, stage, staging).await;
            let passed = result.passed();

            if passed {
                note(
                    run,
                    LogLevel::Info,
                    format!("Stage {} succeeded in {}ms", stage.name, result.duration_ms),
                );
            } else {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit code {}", result.exit_code));
                note(run, LogLevel::Error, format!("Stage {} failed: {}", stage.name, reason));
            }
            run.record(result);

            if !passed {
                run.skipped = self.target.stages[index + 1..]
                    .iter()
                    .map(|s| s.name.clone())
                    .collect();
                if !run.skipped.is_empty() {
                    note(
                        run,
                        LogLevel::Warning,
                        format!("Skipping {}", run.skipped.join(", ")),
                    );
                }
                return RunStatus::Failed;
            }
        }
        RunStatus::Succeeded
    }

    async fn run_stage(
        &self,
        env: &dyn Environment,
        renderer: &CommandRenderer,
        stage: &StageDefinition,
        staging: &Path,
    ) -> StageResult {
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let argv = match renderer.render(&stage.name, &stage.command) {
            Ok(argv) => argv,
            Err(e) => return failed_result(stage, &e, elapsed(started)),
        };
        let request = ExecRequest {
            argv,
            user: stage.user,
            timeout: self.settings.stage_timeout,
        };
        debug!("[{}] {}: {}", self.target.tag, stage.name, request.display());

        let output = match env.exec(&request).await {
            Ok(output) => output,
            Err(e) => return failed_result(stage, &e, elapsed(started)),
        };

        let mut result = StageResult {
            stage_name: stage.name.clone(),
            status: StageStatus::Failed,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            artifacts: Vec::new(),
            duration_ms: 0,
            error: None,
        };

        if result.exit_code == 0 {
            match capture_artifacts(stage, staging) {
                Ok(artifacts) => {
                    result.artifacts = artifacts;
                    result.status = StageStatus::Succeeded;
                }
                Err(e) => result.error = Some(e.to_string()),
            }
        }

        result.duration_ms = elapsed(started);
        result
    }
}

fn failed_result(stage: &StageDefinition, error: &ExecutionError, duration_ms: u64) -> StageResult {
    StageResult {
        stage_name: stage.name.clone(),
        status: StageStatus::Failed,
        exit_code: error.exit_code(),
        stdout: String::new(),
        stderr: String::new(),
        artifacts: Vec::new(),
        duration_ms,
        error: Some(error.to_string()),
    }
}

/// Files in the staging directory matching a stage's artifact patterns
///
/// Every pattern must match at least one regular file.
fn capture_artifacts(
    stage: &StageDefinition,
    staging: &Path,
) -> Result<Vec<PathBuf>, ExecutionError> {
    let root = glob::Pattern::escape(&staging.to_string_lossy());
    let mut captured = Vec::new();

    for pattern in &stage.artifacts {
        let full = format!("{}/{}", root, pattern.trim_start_matches('/'));
        let paths = glob::glob(&full).map_err(|e| ExecutionError::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;

        let matched: Vec<PathBuf> = paths
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();
        if matched.is_empty() {
            return Err(ExecutionError::MissingArtifact {
                stage: stage.name.clone(),
                pattern: pattern.clone(),
            });
        }
        captured.extend(matched);
    }

    captured.sort();
    captured.dedup();
    Ok(captured)
}

fn abort(run: &mut PipelineRun, reason: String) {
    let tag = run.tag.clone();
    checked(&tag, run.start());
    run.skipped = run.planned.clone();
    note(run, LogLevel::Error, reason.clone());
    run.error = Some(reason);
    checked(&tag, run.finish(RunStatus::Failed));
}

fn block(run: &mut PipelineRun, error: &PreconditionError) {
    run.skipped = run.planned.clone();
    note(run, LogLevel::Error, format!("Precondition failed: {}", error));
    run.error = Some(error.to_string());
    checked(&run.tag.clone(), run.finish(RunStatus::PreconditionFailed));
}

/// Logs a transition the pipeline should never attempt
fn checked(tag: &str, result: Result<(), TransitionError>) {
    if let Err(e) = result {
        error!("[{}] {}", tag, e);
    }
}

/// Writes a message to both the run log and tracing
fn note(run: &mut PipelineRun, level: LogLevel, message: impl Into<String>) {
    let message = message.into();
    match level {
        LogLevel::Debug => debug!("[{}] {}", run.tag, message),
        LogLevel::Info => info!("[{}] {}", run.tag, message),
        LogLevel::Warning => warn!("[{}] {}", run.tag, message),
        LogLevel::Error => error!("[{}] {}", run.tag, message),
    }
    run.log(level, message);
}
