//! Environment providers
//!
//! An environment is the execution context one target's commands run in:
//! the bare host, or an ephemeral container with the source checkout and
//! the target's staging directory mounted. Each environment is owned by
//! exactly one pipeline and destroyed when that pipeline ends.

mod container;
mod host;
mod process;

pub use container::{ContainerEnvironment, ContainerProvider, check_runtime_available};
pub use host::{HostEnvironment, HostProvider};
pub use process::ExecOutput;

use async_trait::async_trait;
use kiln_core::domain::stage::StageUser;
use kiln_core::domain::target::{ExecutionMode, Target};
use kiln_core::error::{ExecutionError, ProvisionError};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::command::builtin_vars;
use crate::workspace::Workspace;

/// A command to run inside an environment
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Fully rendered argv; the first element is the program
    pub argv: Vec<String>,
    pub user: StageUser,
    pub timeout: Duration,
}

impl ExecRequest {
    /// The argv joined for logs and error messages
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// A live execution context bound to one target
#[async_trait]
pub trait Environment: Send + Sync {
    /// Identifier (container name for container mode)
    fn id(&self) -> &str;

    fn mode(&self) -> &'static str;

    /// Source checkout path as commands inside the environment see it
    fn source_dir(&self) -> &str;

    /// Staging directory path as commands inside the environment see it
    fn artifact_dir(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Runs a command to completion
    ///
    /// A non-zero exit is not an error; the caller inspects the exit code.
    /// Timeouts, spawn failures and destroyed environments are errors.
    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutionError>;

    /// Releases the environment; calling it again is a no-op
    async fn destroy(&mut self);
}

/// Creates environments for targets
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn create(
        &self,
        target: &Target,
        workspace: &Workspace,
    ) -> Result<Box<dyn Environment>, ProvisionError>;
}

/// Dispatches to the host or container provider based on the target's mode
pub struct ModeProvider {
    host: HostProvider,
    container: ContainerProvider,
}

impl ModeProvider {
    pub fn new(host: HostProvider, container: ContainerProvider) -> Self {
        Self { host, container }
    }
}

#[async_trait]
impl EnvironmentProvider for ModeProvider {
    async fn create(
        &self,
        target: &Target,
        workspace: &Workspace,
    ) -> Result<Box<dyn Environment>, ProvisionError> {
        match target.mode {
            ExecutionMode::Host => self.host.create(target, workspace).await,
            ExecutionMode::Container(_) => self.container.create(target, workspace).await,
        }
    }
}

/// Reads the passthrough variables of a target from the host
///
/// Every variable must be set; a secret silently missing inside the
/// environment would surface much later as an obscure tool failure.
pub(crate) fn read_passthrough(target: &Target) -> Result<Vec<(String, String)>, ProvisionError> {
    target
        .passthrough
        .iter()
        .map(|name| {
            std::env::var(name)
                .map(|value| (name.clone(), value))
                .map_err(|_| ProvisionError::MissingVariable {
                    tag: target.tag.clone(),
                    name: name.clone(),
                })
        })
        .collect()
}

/// Variables injected into an environment; built-ins take precedence over
/// the target's own
pub(crate) fn injected_vars(
    target: &Target,
    source_dir: &str,
    artifact_dir: &str,
) -> BTreeMap<String, String> {
    let mut vars = target.env.clone();
    vars.extend(builtin_vars(target, source_dir, artifact_dir));
    vars
}

/// Short random suffix for environment identifiers
pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
