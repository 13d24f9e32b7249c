//! Host environment
//!
//! Commands run directly on the calling machine. Isolation is limited to
//! the working directory and the injected variables.

use async_trait::async_trait;
use kiln_core::domain::stage::StageUser;
use kiln_core::domain::target::Target;
use kiln_core::error::{ExecutionError, ProvisionError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::{self, ExecOutput};
use super::{Environment, EnvironmentProvider, ExecRequest, injected_vars, read_passthrough, short_id};
use crate::workspace::Workspace;

/// Creates host environments
#[derive(Debug, Clone)]
pub struct HostProvider {
    /// Whether the orchestrator already runs as root
    privileged: bool,
}

impl HostProvider {
    /// Creates a provider, detecting whether the current user is root
    pub fn new() -> Self {
        Self::with_privileged(current_user_is_root())
    }

    pub fn with_privileged(privileged: bool) -> Self {
        Self { privileged }
    }
}

impl Default for HostProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn current_user_is_root() -> bool {
    std::process::Command::new("id")
        .arg("-u")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
        .unwrap_or(false)
}

#[async_trait]
impl EnvironmentProvider for HostProvider {
    async fn create(
        &self,
        target: &Target,
        workspace: &Workspace,
    ) -> Result<Box<dyn Environment>, ProvisionError> {
        read_passthrough(target)?;

        let source_dir = workspace.source.to_string_lossy().to_string();
        let artifact_dir = workspace.staging.to_string_lossy().to_string();
        let vars = injected_vars(target, &source_dir, &artifact_dir);

        let env = HostEnvironment {
            id: format!("host-{}-{}", target.tag, short_id()),
            workdir: workspace.source.clone(),
            source_dir,
            artifact_dir,
            vars,
            privileged: self.privileged,
            running: true,
        };

        info!("Created host environment {} for {}", env.id, target.tag);
        Ok(Box::new(env))
    }
}

/// Environment executing directly on the host
#[derive(Debug)]
pub struct HostEnvironment {
    id: String,
    workdir: PathBuf,
    source_dir: String,
    artifact_dir: String,
    vars: BTreeMap<String, String>,
    privileged: bool,
    running: bool,
}

impl HostEnvironment {
    /// Final argv, with `sudo` in front of root commands when needed
    fn argv_for(&self, request: &ExecRequest) -> Vec<String> {
        let mut argv = Vec::with_capacity(request.argv.len() + 3);
        if request.user == StageUser::Root && !self.privileged {
            argv.extend(["sudo", "-n", "-E"].map(String::from));
        }
        argv.extend(request.argv.iter().cloned());
        argv
    }
}

#[async_trait]
impl Environment for HostEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> &'static str {
        "host"
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
                env: self.id.clone(),
            });
        }

        let argv = self.argv_for(request);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutionError::EmptyCommand {
                stage: request.display(),
            });
        };

        debug!("Executing on host {}: {}", self.id, request.display());

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.workdir)
            .envs(&self.vars);

        process::run(command, &request.display(), request.timeout).await
    }

    async fn destroy(&mut self) {
        if self.running {
            debug!("Releasing host environment {}", self.id);
            self.running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::stage::StageDefinition;
    use kiln_core::domain::target::{Arch, ExecutionMode, OsFamily, PackageFormat};
    use std::time::Duration;

    fn target() -> Target {
        Target {
            tag: "osx".to_string(),
            os: OsFamily::Linux,
            arch: Arch::Amd64,
            format: PackageFormat::None,
            mode: ExecutionMode::Host,
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            passthrough: vec![],
            setup: vec![],
            stages: vec![StageDefinition::new("noop", vec!["true".into()])],
            requires: vec![],
        }
    }

    fn request(argv: &[&str]) -> ExecRequest {
        ExecRequest {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            user: StageUser::Build,
            timeout: Duration::from_secs(10),
        }
    }

    async fn workspace(dir: &tempfile::TempDir) -> Workspace {
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        Workspace::prepare(&dir.path().join("work"), &source, "osx")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exec_in_workdir_with_vars() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir).await;
        let env = HostProvider::with_privileged(false)
            .create(&target(), &ws)
            .await
            .unwrap();

        let output = env
            .exec(&request(&["sh", "-c", "echo $GREETING $KILN_TAG; pwd"]))
            .await
            .unwrap();
        assert!(output.success());
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello osx"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), ws.source.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir).await;
        let mut env = HostProvider::with_privileged(false)
            .create(&target(), &ws)
            .await
            .unwrap();

        env.destroy().await;
        env.destroy().await;
        assert!(!env.is_running());

        let err = env.exec(&request(&["true"])).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_missing_passthrough_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir).await;
        let mut t = target();
        t.passthrough = vec!["KILN_TEST_SURELY_UNSET_SECRET".to_string()];

        let err = HostProvider::with_privileged(false)
            .create(&t, &ws)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::MissingVariable { .. }));
    }

    #[test]
    fn test_root_commands_use_sudo_when_unprivileged() {
        let env = HostEnvironment {
            id: "host-x".to_string(),
            workdir: PathBuf::from("/"),
            source_dir: "/".to_string(),
            artifact_dir: "/tmp".to_string(),
            vars: BTreeMap::new(),
            privileged: false,
            running: true,
        };
        let mut req = request(&["apt-get", "install", "-y", "rpm"]);
        req.user = StageUser::Root;
        assert_eq!(env.argv_for(&req)[..3], ["sudo", "-n", "-E"]);

        let env = HostEnvironment {
            privileged: true,
            ..env
        };
        assert_eq!(env.argv_for(&req)[0], "apt-get");
    }
}
