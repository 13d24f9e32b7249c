//! Container environments
//!
//! Handles the container lifecycle for one target:
//! - Checking that the container runtime (podman or docker) is available
//! - Creating a detached container with the checkout and staging dir mounted
//! - Executing commands in that container as the build user or root
//! - Stopping and removing the container, including after a failed create

use async_trait::async_trait;
use kiln_core::domain::stage::StageUser;
use kiln_core::domain::target::Target;
use kiln_core::error::{ExecutionError, ProvisionError};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::process::{self, ExecOutput};
use super::{Environment, EnvironmentProvider, ExecRequest, injected_vars, read_passthrough, short_id};
use crate::workspace::Workspace;

/// Mount point of the source checkout inside containers
pub const CONTAINER_SOURCE_DIR: &str = "/workspace";

/// Mount point of the target's staging directory inside containers
pub const CONTAINER_ARTIFACT_DIR: &str = "/artifacts";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

/// Checks that the container runtime is installed and answering
pub async fn check_runtime_available(runtime: &str) -> Result<String, ProvisionError> {
    let mut command = Command::new(runtime);
    command.arg("--version");

    let output = process::run(command, &format!("{} --version", runtime), CONTROL_TIMEOUT)
        .await
        .map_err(|e| ProvisionError::RuntimeUnavailable {
            runtime: runtime.to_string(),
            reason: e.to_string(),
        })?;

    if !output.success() {
        return Err(ProvisionError::RuntimeUnavailable {
            runtime: runtime.to_string(),
            reason: output.stderr.trim().to_string(),
        });
    }

    let version = output.stdout.trim().to_string();
    info!("Container runtime is available: {}", version);
    Ok(version)
}

/// Creates one container per target
#[derive(Debug, Clone)]
pub struct ContainerProvider {
    runtime: String,
}

impl ContainerProvider {
    /// # Arguments
    /// * `runtime` - Container CLI to invoke (`podman` or `docker`)
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Arguments of the `run` invocation that creates the container
    fn run_args(&self, target: &Target, workspace: &Workspace, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("kiln.tag={}", target.tag),
            // Override any image entrypoint
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
            "-v".to_string(),
            format!("{}:{}", workspace.source.display(), CONTAINER_SOURCE_DIR),
            "-v".to_string(),
            format!("{}:{}", workspace.staging.display(), CONTAINER_ARTIFACT_DIR),
            "-w".to_string(),
            CONTAINER_SOURCE_DIR.to_string(),
        ];

        for (key, value) in injected_vars(target, CONTAINER_SOURCE_DIR, CONTAINER_ARTIFACT_DIR) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Name only: the runtime copies the value from its own environment,
        // so secrets never appear in the argument list
        for name in &target.passthrough {
            args.push("-e".to_string());
            args.push(name.clone());
        }

        if let Some(spec) = target.container() {
            args.push(spec.image.clone());
        }
        args.push("-c".to_string());
        args.push("sleep infinity".to_string());

        args
    }
}

#[async_trait]
impl EnvironmentProvider for ContainerProvider {
    async fn create(
        &self,
        target: &Target,
        workspace: &Workspace,
    ) -> Result<Box<dyn Environment>, ProvisionError> {
        let spec = target
            .container()
            .ok_or_else(|| ProvisionError::CreateFailed {
                tag: target.tag.clone(),
                exit_code: -1,
                stderr: "target has no container image".to_string(),
            })?;
        let secrets = read_passthrough(target)?;

        let name = format!("kiln-{}-{}", target.tag.to_lowercase(), short_id());
        info!(
            "Creating container {} for {} with image {}",
            name, target.tag, spec.image
        );

        let mut command = Command::new(&self.runtime);
        command
            .args(self.run_args(target, workspace, &name))
            .envs(secrets);

        let command_line = format!("{} run {}", self.runtime, spec.image);
        let output = match process::run(command, &command_line, CONTROL_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                // The runtime may have created the container before we gave up
                force_remove(&self.runtime, &name).await;
                return Err(match e {
                    ExecutionError::Spawn { source, .. } => ProvisionError::RuntimeUnavailable {
                        runtime: self.runtime.clone(),
                        reason: source.to_string(),
                    },
                    other => ProvisionError::CreateFailed {
                        tag: target.tag.clone(),
                        exit_code: other.exit_code(),
                        stderr: other.to_string(),
                    },
                });
            }
        };

        if !output.stdout.trim().is_empty() {
            debug!("{} run stdout: {}", self.runtime, output.stdout.trim());
        }
        if !output.stderr.trim().is_empty() {
            debug!("{} run stderr: {}", self.runtime, output.stderr.trim());
        }

        if !output.success() {
            error!(
                "Failed to start container for {}: exit_code={}, stderr='{}'",
                target.tag,
                output.exit_code,
                output.stderr.trim()
            );
            force_remove(&self.runtime, &name).await;
            return Err(ProvisionError::CreateFailed {
                tag: target.tag.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let container_id = output.stdout.trim().to_string();
        info!(
            "Container {} started successfully with ID: {}",
            name, container_id
        );

        Ok(Box::new(ContainerEnvironment {
            runtime: self.runtime.clone(),
            name,
            build_user: spec.user.clone(),
            running: true,
        }))
    }
}

/// Best-effort removal of a container by name; absent containers are fine
async fn force_remove(runtime: &str, name: &str) {
    let mut command = Command::new(runtime);
    command.args(["rm", "-f", name]);

    match process::run(command, &format!("{} rm -f {}", runtime, name), CONTROL_TIMEOUT).await {
        Ok(output) if output.success() => debug!("Container {} removed", name),
        Ok(output) => debug!(
            "Container {} not removed (may not exist): {}",
            name,
            output.stderr.trim()
        ),
        Err(e) => warn!("Failed to remove container {}: {}", name, e),
    }
}

/// A running container dedicated to one target
#[derive(Debug)]
pub struct ContainerEnvironment {
    runtime: String,
    name: String,
    build_user: Option<String>,
    running: bool,
}

impl ContainerEnvironment {
    /// Arguments of the `exec` invocation for a request
    fn exec_args(&self, request: &ExecRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        let user = match request.user {
            StageUser::Root => Some("root"),
            StageUser::Build => self.build_user.as_deref(),
        };
        if let Some(user) = user {
            args.push("--user".to_string());
            args.push(user.to_string());
        }

        args.push("-w".to_string());
        args.push(CONTAINER_SOURCE_DIR.to_string());
        args.push(self.name.clone());
        args.extend(request.argv.iter().cloned());
        args
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn id(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> &'static str {
        "container"
    }

    fn source_dir(&self) -> &str {
        CONTAINER_SOURCE_DIR
    }

    fn artifact_dir(&self) -> &str {
        CONTAINER_ARTIFACT_DIR
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutionError> {
        if !self.running {
            return Err(ExecutionError::Unreachable {
                env: self.name.clone(),
            });
        }
        if request.argv.is_empty() {
            return Err(ExecutionError::EmptyCommand {
                stage: self.name.clone(),
            });
        }

        debug!(
            "Executing in container {}: {}",
            self.name,
            request.display()
        );

        let mut command = Command::new(&self.runtime);
        command.args(self.exec_args(request));

        let output = process::run(command, &request.display(), request.timeout).await?;
        if !output.success() {
            debug!(
                "Command failed in container {}: exit_code={} stderr='{}'",
                self.name,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }

    async fn destroy(&mut self) {
        if !self.running {
            return;
        }

        info!("Removing container {}", self.name);

        // Stop first so the process gets a chance to exit cleanly
        let mut stop = Command::new(&self.runtime);
        stop.args(["stop", "-t", "5", self.name.as_str()]);
        let _ = process::run(stop, "stop", CONTROL_TIMEOUT).await;

        force_remove(&self.runtime, &self.name).await;
        self.running = false;
    }
}

impl Drop for ContainerEnvironment {
    fn drop(&mut self) {
        if self.running {
            warn!(
                "Container {} dropped without destroy, removing it",
                self.name
            );
            let _ = std::process::Command::new(&self.runtime)
                .args(["rm", "-f", self.name.as_str()])
                .output();
        }
    }
}
