//! Build matrix coordinator
//!
//! Launches every target pipeline in its own task, bounded by a semaphore
//! on the number of simultaneously active environments. Targets that
//! require another target of the same matrix wait for its final status
//! before taking a slot. A failing or panicking pipeline never affects its
//! siblings.

use anyhow::{Result, bail};
use kiln_core::domain::publication::PublicationRecord;
use kiln_core::domain::run::{PipelineRun, RunStatus};
use kiln_core::domain::target::Target;
use kiln_core::error::PreconditionError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::environment::EnvironmentProvider;
use crate::pipeline::{PipelineSettings, TargetPipeline};
use crate::publisher::Publisher;
use crate::store::ArtifactStore;

/// Final status of a target in a matrix run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    Succeeded,
    Failed,
    PreconditionFailed,
    /// The build succeeded but its artifacts could not be published
    PublishFailed,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Succeeded => write!(f, "succeeded"),
            TargetStatus::Failed => write!(f, "failed"),
            TargetStatus::PreconditionFailed => write!(f, "precondition-failed"),
            TargetStatus::PublishFailed => write!(f, "publish-failed"),
        }
    }
}

/// Outcome of one target
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub tag: String,
    pub status: TargetStatus,
    pub run: PipelineRun,
    pub publication: Option<PublicationRecord>,
    pub publish_error: Option<String>,
}

impl TargetReport {
    fn from_run(run: PipelineRun) -> Self {
        let status = match run.status() {
            RunStatus::Succeeded => TargetStatus::Succeeded,
            RunStatus::PreconditionFailed => TargetStatus::PreconditionFailed,
            _ => TargetStatus::Failed,
        };
        Self {
            tag: run.tag.clone(),
            status,
            run,
            publication: None,
            publish_error: None,
        }
    }
}

/// Outcome of a whole matrix run, in matrix order
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatrixReport {
    pub targets: Vec<TargetReport>,
}

impl MatrixReport {
    /// Whether every target succeeded
    pub fn succeeded(&self) -> bool {
        self.targets
            .iter()
            .all(|t| t.status == TargetStatus::Succeeded)
    }

    pub fn failed_tags(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.status != TargetStatus::Succeeded)
            .map(|t| t.tag.as_str())
            .collect()
    }

    pub fn get(&self, tag: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.tag == tag)
    }
}

/// Keeps only the targets named in `only`, in matrix order
///
/// An empty filter keeps everything; naming an unknown tag is an error.
pub fn select_targets(targets: Vec<Target>, only: &[String]) -> Result<Vec<Target>> {
    if only.is_empty() {
        return Ok(targets);
    }

    let unknown: Vec<&str> = only
        .iter()
        .filter(|tag| !targets.iter().any(|t| &t.tag == *tag))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        bail!("unknown target(s): {}", unknown.join(", "));
    }

    Ok(targets
        .into_iter()
        .filter(|t| only.contains(&t.tag))
        .collect())
}

pub struct Coordinator {
    provider: Arc<dyn EnvironmentProvider>,
    settings: PipelineSettings,
    concurrency: usize,
    store: Option<Arc<dyn ArtifactStore>>,
    publish: bool,
}

impl Coordinator {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        settings: PipelineSettings,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            settings,
            concurrency: concurrency.max(1),
            store: None,
            publish: false,
        }
    }

    /// Store used for preconditions and, unless disabled, publication
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self.publish = true;
        self
    }

    pub fn with_publishing(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    /// Runs every target and collects their final status
    pub async fn run(&self, targets: Vec<Target>) -> MatrixReport {
        info!(
            "Running {} target(s), at most {} at a time",
            targets.len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let publisher = match (&self.store, self.publish) {
            (Some(store), true) => Some(Arc::new(Publisher::new(Arc::clone(store)))),
            _ => None,
        };

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for target in &targets {
            let (tx, rx) = watch::channel(None::<TargetStatus>);
            senders.insert(target.tag.clone(), tx);
            receivers.insert(target.tag.clone(), rx);
        }

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let target = Arc::new(target);
            let dependencies: Vec<(String, watch::Receiver<Option<TargetStatus>>)> = target
                .requires
                .iter()
                .filter_map(|p| receivers.get(&p.tag).map(|rx| (p.tag.clone(), rx.clone())))
                .collect();
            let Some(done) = senders.remove(&target.tag) else {
                continue;
            };

            let task = TargetTask {
                target: Arc::clone(&target),
                pipeline: self.pipeline(Arc::clone(&target)),
                publisher: publisher.clone(),
                semaphore: Arc::clone(&semaphore),
                dependencies,
                done,
            };
            handles.push((target, tokio::spawn(task.run())));
        }
        drop(receivers);

        let mut report = MatrixReport::default();
        for (target, handle) in handles {
            let target_report = match handle.await {
                Ok(target_report) => target_report,
                Err(e) => {
                    error!("Pipeline task for {} panicked: {}", target.tag, e);
                    TargetReport::from_run(TargetPipeline::aborted(
                        &target,
                        format!("pipeline task panicked: {}", e),
                    ))
                }
            };
            info!("{}: {}", target_report.tag, target_report.status);
            report.targets.push(target_report);
        }

        report
    }

    fn pipeline(&self, target: Arc<Target>) -> TargetPipeline {
        let pipeline =
            TargetPipeline::new(target, Arc::clone(&self.provider), self.settings.clone());
        match &self.store {
            Some(store) => pipeline.with_store(Arc::clone(store)),
            None => pipeline,
        }
    }
}

/// Everything one spawned target task owns
struct TargetTask {
    target: Arc<Target>,
    pipeline: TargetPipeline,
    publisher: Option<Arc<Publisher>>,
    semaphore: Arc<Semaphore>,
    dependencies: Vec<(String, watch::Receiver<Option<TargetStatus>>)>,
    /// Announces this target's final status to its dependents; dropping it
    /// unannounced (a panic) reads as a failure
    done: watch::Sender<Option<TargetStatus>>,
}

impl TargetTask {
    async fn run(mut self) -> TargetReport {
        let report = self.execute().await;
        self.done.send_replace(Some(report.status));
        report
    }

    async fn execute(&mut self) -> TargetReport {
        let tag = self.target.tag.clone();

        for (dependency, rx) in &mut self.dependencies {
            debug!("{} waiting for {}", tag, dependency);
            let status = rx
                .wait_for(Option::is_some)
                .await
                .map(|seen| *seen)
                .ok()
                .flatten()
                .unwrap_or(TargetStatus::Failed);

            if status != TargetStatus::Succeeded {
                let error = PreconditionError::DependencyFailed {
                    tag: tag.clone(),
                    dependency: dependency.clone(),
                    status: status.to_string(),
                };
                return TargetReport::from_run(TargetPipeline::blocked(&self.target, &error));
            }
        }

        // The semaphore is never closed
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        debug!("{} acquired a slot", tag);
        let run = self.pipeline.run().await;
        drop(permit);

        let mut report = TargetReport::from_run(run);
        if report.status != TargetStatus::Succeeded {
            return report;
        }

        if let Some(publisher) = &self.publisher {
            match publisher.publish(&report.run).await {
                Ok(record) => report.publication = Some(record),
                Err(e) => {
                    warn!("Publishing {} failed: {}", tag, e);
                    report.status = TargetStatus::PublishFailed;
                    report.publish_error = Some(e.to_string());
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::stage::StageDefinition;
    use kiln_core::domain::target::{Arch, ExecutionMode, OsFamily, PackageFormat};
    use std::collections::BTreeMap;

    fn target(tag: &str) -> Target {
        Target {
            tag: tag.to_string(),
            os: OsFamily::Linux,
            arch: Arch::Amd64,
            format: PackageFormat::Deb,
            mode: ExecutionMode::Host,
            env: BTreeMap::new(),
            passthrough: vec![],
            setup: vec![],
            stages: vec![StageDefinition::new("build", vec!["true".into()])],
            requires: vec![],
        }
    }

    #[test]
    fn test_select_targets() {
        let all = vec![target("a"), target("b"), target("c")];

        let kept = select_targets(all.clone(), &[]).unwrap();
        assert_eq!(kept.len(), 3);

        let kept = select_targets(all.clone(), &["c".to_string(), "a".to_string()]).unwrap();
        let tags: Vec<&str> = kept.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "c"]);

        let err = select_targets(all, &["z".to_string()]).unwrap_err();
        assert!(err.to_string().contains("z"));
    }

    #[test]
    fn test_matrix_report() {
        let mut ok = TargetReport::from_run(TargetPipeline::aborted(&target("a"), "x"));
        ok.status = TargetStatus::Succeeded;
        let failed = TargetReport::from_run(TargetPipeline::aborted(&target("b"), "boom"));
        assert_eq!(failed.status, TargetStatus::Failed);

        let report = MatrixReport {
            targets: vec![ok.clone()],
        };
        assert!(report.succeeded());

        let report = MatrixReport {
            targets: vec![ok, failed],
        };
        assert!(!report.succeeded());
        assert_eq!(report.failed_tags(), vec!["b"]);
        assert!(report.get("b").is_some());
        assert!(report.get("c").is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["targets"][1]["status"], "failed");
        assert_eq!(json["targets"][1]["run"]["status"], "Failed");
    }
}
