//! Matrix runs against a scripted environment provider and a local store

use async_trait::async_trait;
use kiln_core::domain::publication::PublicationRecord;
use kiln_core::domain::run::RunStatus;
use kiln_core::domain::stage::{StageDefinition, StageUser};
use kiln_core::domain::target::{
    Arch, ContainerSpec, ExecutionMode, OsFamily, PackageFormat, Precondition, SetupCommand,
    Target,
};
use kiln_core::error::{ExecutionError, ProvisionError};
use kiln_runner::environment::{Environment, EnvironmentProvider, ExecOutput, ExecRequest};
use kiln_runner::store::{ArtifactStore, LocalStore};
use kiln_runner::workspace::Workspace;
use kiln_runner::{
    ContainerProvider, Coordinator, HostProvider, ModeProvider, PipelineSettings, TargetStatus,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Shared bookkeeping of the scripted provider
#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Journal {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn has(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

/// Provider whose environments interpret a tiny command language:
///
/// - `produce PATH CONTENT` writes a file
/// - `require-file PATH` exits 1 unless the file exists
/// - `exit N` exits with N
/// - `sleep MS` sleeps
/// - `panic` panics
/// - anything else succeeds
struct ScriptedProvider {
    journal: Arc<Journal>,
    fail_create: HashSet<String>,
}

impl ScriptedProvider {
    fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            fail_create: HashSet::new(),
        }
    }

    fn failing_create(mut self, tag: &str) -> Self {
        self.fail_create.insert(tag.to_string());
        self
    }
}

#[async_trait]
impl EnvironmentProvider for ScriptedProvider {
    async fn create(
        &self,
        target: &Target,
        workspace: &Workspace,
    ) -> Result<Box<dyn Environment>, ProvisionError> {
        self.journal.push(format!("create:{}", target.tag));
        if self.fail_create.contains(&target.tag) {
            return Err(ProvisionError::CreateFailed {
                tag: target.tag.clone(),
                exit_code: 125,
                stderr: "image not found".to_string(),
            });
        }

        let active = self.journal.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(ScriptedEnvironment {
            tag: target.tag.clone(),
            source_dir: workspace.source.to_string_lossy().to_string(),
            artifact_dir: workspace.staging.to_string_lossy().to_string(),
            journal: Arc::clone(&self.journal),
            running: true,
        }))
    }
}

struct ScriptedEnvironment {
    tag: String,
    source_dir: String,
    artifact_dir: String,
    journal: Arc<Journal>,
    running: bool,
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    fn id(&self) -> &str {
        &self.tag
    }

    fn mode(&self) -> &'static str {
        "scripted"
    }

    fn source_dir(&self) -> &str {
        &self.source_dir
    }

    fn artifact_dir(&self) -> &str {
        &self.artifact_dir
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutionError> {
        if !self.running {
            return Err(ExecutionError::Unreachable {
                env: self.tag.clone(),
            });
        }
        self.journal
            .push(format!("exec:{}:{}", self.tag, request.argv.join(" ")));

        let argv: Vec<&str> = request.argv.iter().map(String::as_str).collect();
        let exit_code = match argv.as_slice() {
            ["produce", path, content] => {
                let path = Path::new(path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(path, content).unwrap();
                0
            }
            ["require-file", path] => {
                if Path::new(path).is_file() {
                    0
                } else {
                    1
                }
            }
            ["exit", code] => code.parse().unwrap(),
            ["sleep", ms] => {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                0
            }
            ["panic"] => panic!("scripted panic in {}", self.tag),
            _ => 0,
        };

        Ok(ExecOutput {
            exit_code,
            stdout: format!("ran {}", request.display()),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "scripted failure".to_string()
            },
        })
    }

    async fn destroy(&mut self) {
        if self.running {
            self.running = false;
            self.journal.active.fetch_sub(1, Ordering::SeqCst);
            self.journal.push(format!("destroy:{}", self.tag));
        }
    }
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A target whose `package` stage produces `<tag>.<ext>` with `content`
fn target(tag: &str, format: PackageFormat, content: &str) -> Target {
    let file = format!("${{KILN_ARTIFACT_DIR}}/{}.{}", tag, format);
    Target {
        tag: tag.to_string(),
        os: OsFamily::Linux,
        arch: Arch::Amd64,
        format,
        mode: ExecutionMode::Host,
        env: BTreeMap::new(),
        passthrough: vec![],
        setup: vec![],
        stages: vec![
            StageDefinition::new("install", argv(&["apt-get", "install", "-y", "build-essential"]))
                .as_root(),
            StageDefinition::new("build", argv(&["make"])),
            StageDefinition::new("package", argv(&["produce", &file, content]))
                .with_artifact(format!("*.{}", format)),
        ],
        requires: vec![],
    }
}

fn server_target() -> Target {
    let mut server = target("server_deb", PackageFormat::Deb, "server");
    server.requires = vec![Precondition {
        tag: "ubuntu_64bit".to_string(),
        dest: "deps/ubuntu_64bit".to_string(),
    }];
    server.stages.insert(
        1,
        StageDefinition::new(
            "check_client",
            argv(&["require-file", "${KILN_ARTIFACT_DIR}/deps/ubuntu_64bit/ubuntu_64bit.deb"]),
        ),
    );
    server
}

struct Fixture {
    dir: TempDir,
    journal: Arc<Journal>,
    store: Arc<LocalStore>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("source")).unwrap();
        let store = Arc::new(LocalStore::new(dir.path().join("store")));
        Self {
            dir,
            journal: Arc::new(Journal::default()),
            store,
        }
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_dir: self.dir.path().join("work"),
            source_dir: self.dir.path().join("source"),
            stage_timeout: Duration::from_secs(30),
        }
    }

    fn coordinator(&self, concurrency: usize) -> Coordinator {
        self.coordinator_with(ScriptedProvider::new(Arc::clone(&self.journal)), concurrency)
    }

    fn coordinator_with(&self, provider: ScriptedProvider, concurrency: usize) -> Coordinator {
        Coordinator::new(Arc::new(provider), self.settings(), concurrency)
            .with_store(self.store.clone())
    }

    fn published(&self, tag: &str) -> PathBuf {
        self.dir.path().join("store").join(tag)
    }

    fn manifest(&self, tag: &str) -> PublicationRecord {
        let bytes = std::fs::read(self.published(tag).join("MANIFEST.json")).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[tokio::test]
async fn test_failed_target_does_not_affect_sibling() {
    let fx = Fixture::new();
    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "client");
    ubuntu.stages[0].command = argv(&["exit", "1"]);
    let centos = target("centos_64bit", PackageFormat::Rpm, "client");

    let report = fx.coordinator(2).run(vec![ubuntu, centos]).await;

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    assert_eq!(ubuntu.status, TargetStatus::Failed);
    assert_eq!(ubuntu.run.stages.len(), 1);
    assert_eq!(ubuntu.run.stages[0].exit_code, 1);
    assert_eq!(ubuntu.run.stages[0].stderr, "scripted failure");
    assert_eq!(ubuntu.run.skipped, vec!["build", "package"]);
    assert!(ubuntu.publication.is_none());
    assert!(!fx.journal.has("exec:ubuntu_64bit:make"));
    assert!(fx.journal.has("destroy:ubuntu_64bit"));

    let centos = report.get("centos_64bit").unwrap();
    assert_eq!(centos.status, TargetStatus::Succeeded);
    assert!(centos.run.is_complete());
    assert!(centos.publication.is_some());

    assert!(!report.succeeded());
    assert_eq!(report.failed_tags(), vec!["ubuntu_64bit"]);

    // Nothing is published for the failed target, the sibling is complete
    assert!(!fx.published("ubuntu_64bit").exists());
    assert_eq!(
        std::fs::read_to_string(fx.published("centos_64bit").join("centos_64bit.rpm")).unwrap(),
        "client"
    );
    assert_eq!(fx.journal.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_publication_record_matches_store() {
    let fx = Fixture::new();
    let report = fx
        .coordinator(1)
        .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "v1")])
        .await;
    assert!(report.succeeded());

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    let record = ubuntu.publication.as_ref().unwrap();
    assert_eq!(record.run_id, ubuntu.run.id);
    assert_eq!(record.objects.len(), 1);
    assert_eq!(record.objects[0].name, "ubuntu_64bit.deb");
    assert_eq!(record.objects[0].size, 2);
    assert_eq!(record.remote_path, fx.store.location("ubuntu_64bit"));

    let manifest = fx.manifest("ubuntu_64bit");
    assert_eq!(manifest.checksum, record.checksum);

    // The temporary upload prefix is gone after promotion
    assert!(fx.store.list(".staging").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_dependency_blocks_before_environment() {
    let fx = Fixture::new();
    let report = fx.coordinator(2).run(vec![server_target()]).await;

    let server = report.get("server_deb").unwrap();
    assert_eq!(server.status, TargetStatus::PreconditionFailed);
    assert_eq!(server.run.status(), RunStatus::PreconditionFailed);
    assert!(server.run.stages.is_empty());
    assert!(server.run.error.as_ref().unwrap().contains("none are published"));
    assert!(!fx.journal.has("create:server_deb"));
    assert!(!report.succeeded());
}

#[tokio::test]
async fn test_failed_dependency_in_matrix_blocks_dependent() {
    let fx = Fixture::new();
    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "client");
    ubuntu.stages[1].command = argv(&["exit", "2"]);

    let report = fx.coordinator(2).run(vec![server_target(), ubuntu]).await;

    assert_eq!(report.get("ubuntu_64bit").unwrap().status, TargetStatus::Failed);
    let server = report.get("server_deb").unwrap();
    assert_eq!(server.status, TargetStatus::PreconditionFailed);
    assert!(server.run.error.as_ref().unwrap().contains("ubuntu_64bit"));
    assert!(!fx.journal.has("create:server_deb"));
}

#[tokio::test]
async fn test_dependency_in_matrix_is_fetched_after_publication() {
    let fx = Fixture::new();
    let report = fx
        .coordinator(2)
        .run(vec![
            server_target(),
            target("ubuntu_64bit", PackageFormat::Deb, "client"),
        ])
        .await;

    assert!(report.succeeded(), "failed: {:?}", report.failed_tags());
    let server = report.get("server_deb").unwrap();
    assert!(server.run.stages.iter().any(|s| s.stage_name == "check_client"));

    // Fetched dependencies are not part of the server's own artifact set
    let names: Vec<&str> = server
        .publication
        .as_ref()
        .unwrap()
        .objects
        .iter()
        .map(|o| o.name.as_str())
        .collect();
    assert_eq!(names, vec!["server_deb.deb"]);
}

#[tokio::test]
async fn test_republish_replaces_previous_publication() {
    let fx = Fixture::new();

    let first = fx
        .coordinator(1)
        .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "old build")])
        .await;
    assert!(first.succeeded());

    let second = fx
        .coordinator(1)
        .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "new build")])
        .await;
    assert!(second.succeeded());

    assert_eq!(
        std::fs::read_to_string(fx.published("ubuntu_64bit").join("ubuntu_64bit.deb")).unwrap(),
        "new build"
    );
    let manifest = fx.manifest("ubuntu_64bit");
    assert_eq!(manifest.run_id, second.get("ubuntu_64bit").unwrap().run.id);
    assert_ne!(manifest.run_id, first.get("ubuntu_64bit").unwrap().run.id);
}

#[tokio::test]
async fn test_failed_rerun_keeps_previous_publication() {
    let fx = Fixture::new();
    let first = fx
        .coordinator(1)
        .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "good")])
        .await;
    assert!(first.succeeded());

    let mut broken = target("ubuntu_64bit", PackageFormat::Deb, "bad");
    broken.stages[1].command = argv(&["exit", "1"]);
    let second = fx.coordinator(1).run(vec![broken]).await;
    assert!(!second.succeeded());

    assert_eq!(
        std::fs::read_to_string(fx.published("ubuntu_64bit").join("ubuntu_64bit.deb")).unwrap(),
        "good"
    );
}

#[tokio::test]
async fn test_concurrency_bound() {
    let fx = Fixture::new();
    let targets: Vec<Target> = (0..5)
        .map(|i| {
            let mut t = target(&format!("t{}", i), PackageFormat::Deb, "x");
            t.stages[1].command = argv(&["sleep", "50"]);
            t
        })
        .collect();

    let report = fx.coordinator(2).run(targets).await;

    assert!(report.succeeded());
    assert_eq!(report.targets.len(), 5);
    assert!(fx.journal.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(fx.journal.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_artifact_fails_stage() {
    let fx = Fixture::new();
    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "x");
    ubuntu.stages[2] = StageDefinition::new("package", argv(&["dpkg-buildpackage"]))
        .with_artifact("*.deb");

    let report = fx.coordinator(1).run(vec![ubuntu]).await;
    let ubuntu = report.get("ubuntu_64bit").unwrap();

    assert_eq!(ubuntu.status, TargetStatus::Failed);
    let package = ubuntu.run.first_failure().unwrap();
    assert_eq!(package.stage_name, "package");
    assert_eq!(package.exit_code, 0);
    assert!(package.error.as_ref().unwrap().contains("*.deb"));
    assert!(!fx.published("ubuntu_64bit").exists());
}

#[tokio::test]
async fn test_setup_failure_runs_no_stages() {
    let fx = Fixture::new();
    let mut centos = target("centos_32bit", PackageFormat::Rpm, "x");
    centos.setup = vec![SetupCommand {
        command: argv(&["exit", "100"]),
        user: StageUser::Root,
    }];

    let report = fx.coordinator(1).run(vec![centos]).await;
    let centos = report.get("centos_32bit").unwrap();

    assert_eq!(centos.status, TargetStatus::Failed);
    assert!(centos.run.stages.is_empty());
    assert_eq!(centos.run.skipped.len(), 3);
    assert!(centos.run.error.as_ref().unwrap().contains("setup"));
    assert!(fx.journal.has("destroy:centos_32bit"));
}

#[tokio::test]
async fn test_provision_failure_is_local_to_target() {
    let fx = Fixture::new();
    let provider =
        ScriptedProvider::new(Arc::clone(&fx.journal)).failing_create("centos_64bit");

    let report = fx
        .coordinator_with(provider, 2)
        .run(vec![
            target("centos_64bit", PackageFormat::Rpm, "x"),
            target("ubuntu_64bit", PackageFormat::Deb, "x"),
        ])
        .await;

    let centos = report.get("centos_64bit").unwrap();
    assert_eq!(centos.status, TargetStatus::Failed);
    assert!(centos.run.stages.is_empty());
    assert!(centos.run.error.as_ref().unwrap().contains("image not found"));
    assert_eq!(
        report.get("ubuntu_64bit").unwrap().status,
        TargetStatus::Succeeded
    );
}

#[tokio::test]
async fn test_panicking_pipeline_is_reported_failed() {
    let fx = Fixture::new();
    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "x");
    ubuntu.stages[1].command = argv(&["panic"]);

    let report = fx
        .coordinator(2)
        .run(vec![ubuntu, target("centos_64bit", PackageFormat::Rpm, "x")])
        .await;

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    assert_eq!(ubuntu.status, TargetStatus::Failed);
    assert!(ubuntu.run.error.as_ref().unwrap().contains("panicked"));
    assert_eq!(
        report.get("centos_64bit").unwrap().status,
        TargetStatus::Succeeded
    );
}

#[tokio::test]
async fn test_no_publish_leaves_store_untouched() {
    let fx = Fixture::new();
    let report = fx
        .coordinator(1)
        .with_publishing(false)
        .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "x")])
        .await;

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    assert_eq!(ubuntu.status, TargetStatus::Succeeded);
    assert!(ubuntu.publication.is_none());
    assert!(!fx.published("ubuntu_64bit").exists());
}

#[tokio::test]
async fn test_publish_failure_is_reported_separately() {
    let fx = Fixture::new();
    // A store rooted at a regular file cannot accept uploads
    let blocked = fx.dir.path().join("not-a-dir");
    std::fs::write(&blocked, b"").unwrap();

    let report = Coordinator::new(
        Arc::new(ScriptedProvider::new(Arc::clone(&fx.journal))),
        fx.settings(),
        1,
    )
    .with_store(Arc::new(LocalStore::new(&blocked)))
    .run(vec![target("ubuntu_64bit", PackageFormat::Deb, "x")])
    .await;

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    assert_eq!(ubuntu.status, TargetStatus::PublishFailed);
    assert_eq!(ubuntu.run.status(), RunStatus::Succeeded);
    assert!(ubuntu.publish_error.is_some());
    assert!(!report.succeeded());
}

#[tokio::test]
async fn test_stage_commands_are_rendered() {
    let fx = Fixture::new();
    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "x");
    ubuntu.env.insert("BUCKET".to_string(), "releases".to_string());
    ubuntu.stages[1].command = argv(&["upload", "gs://${BUCKET}/${KILN_TAG}", "$$HOME"]);

    let report = fx.coordinator(1).run(vec![ubuntu]).await;
    assert!(report.succeeded());
    assert_eq!(
        fx.journal
            .count("exec:ubuntu_64bit:upload gs://releases/ubuntu_64bit $HOME"),
        1
    );
}

#[tokio::test]
async fn test_missing_runtime_fails_only_container_targets() {
    let fx = Fixture::new();

    let mut osx = target("osx", PackageFormat::None, "");
    osx.os = OsFamily::Darwin;
    osx.stages = vec![
        StageDefinition::new(
            "package",
            argv(&["sh", "-c", "printf pkg > ${KILN_ARTIFACT_DIR}/osx.pkg"]),
        )
        .with_artifact("*.pkg"),
    ];

    let mut ubuntu = target("ubuntu_64bit", PackageFormat::Deb, "client");
    ubuntu.mode = ExecutionMode::Container(ContainerSpec {
        image: "ubuntu:22.04".to_string(),
        user: None,
    });

    let provider = ModeProvider::new(
        HostProvider::with_privileged(false),
        ContainerProvider::new("kiln-no-such-runtime"),
    );
    let report = Coordinator::new(Arc::new(provider), fx.settings(), 2)
        .with_store(fx.store.clone())
        .run(vec![osx, ubuntu])
        .await;

    let ubuntu = report.get("ubuntu_64bit").unwrap();
    assert_eq!(ubuntu.status, TargetStatus::Failed);
    assert!(ubuntu.run.stages.is_empty());
    assert!(
        ubuntu
            .run
            .error
            .as_ref()
            .unwrap()
            .contains("kiln-no-such-runtime")
    );

    let osx = report.get("osx").unwrap();
    assert_eq!(osx.status, TargetStatus::Succeeded);
    assert_eq!(
        std::fs::read_to_string(fx.published("osx").join("osx.pkg")).unwrap(),
        "pkg"
    );
}
