//! Stage command rendering
//!
//! Turns command templates into the argv actually executed: placeholders
//! are expanded from the target's variables, and 32-bit targets on a
//! 64-bit Linux host get every command wrapped in `linux32`.

use kiln_core::domain::target::Target;
use kiln_core::error::ExecutionError;
use kiln_core::template::expand;
use std::collections::BTreeMap;

/// Program that forces a 32-bit execution personality
pub const PERSONALITY_WRAPPER: &str = "linux32";

/// Built-in variables for a target, given the paths its environment sees
pub fn builtin_vars(
    target: &Target,
    source_dir: &str,
    artifact_dir: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("KILN_TAG".to_string(), target.tag.clone()),
        ("KILN_SOURCE_DIR".to_string(), source_dir.to_string()),
        ("KILN_ARTIFACT_DIR".to_string(), artifact_dir.to_string()),
        ("KILN_OS".to_string(), target.os.to_string()),
        ("KILN_ARCH".to_string(), target.arch.to_string()),
        ("KILN_FORMAT".to_string(), target.format.to_string()),
    ])
}

/// Whether commands of a target must run under a 32-bit personality
pub fn needs_personality(target: &Target, host_os: &str, host_arch: &str) -> bool {
    target.arch.is_32bit()
        && host_os == "linux"
        && matches!(host_arch, "x86_64" | "aarch64" | "powerpc64" | "s390x")
}

/// Renders command templates for one target inside one environment
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    vars: BTreeMap<String, String>,
    personality: bool,
}

impl CommandRenderer {
    /// Creates a renderer using the current host's OS and architecture
    pub fn new(target: &Target, source_dir: &str, artifact_dir: &str) -> Self {
        let mut vars = target.env.clone();
        vars.extend(builtin_vars(target, source_dir, artifact_dir));
        Self {
            vars,
            personality: needs_personality(
                target,
                std::env::consts::OS,
                std::env::consts::ARCH,
            ),
        }
    }

    /// Overrides host detection of the 32-bit wrapper
    pub fn with_personality(mut self, personality: bool) -> Self {
        self.personality = personality;
        self
    }

    /// Renders a template into an argv
    ///
    /// # Arguments
    /// * `name` - Stage or setup step the command belongs to, for errors
    /// * `template` - Command template, one element per argument
    pub fn render(&self, name: &str, template: &[String]) -> Result<Vec<String>, ExecutionError> {
        if template.is_empty() {
            return Err(ExecutionError::EmptyCommand {
                stage: name.to_string(),
            });
        }

        let mut argv = Vec::with_capacity(template.len() + 1);
        if self.personality {
            argv.push(PERSONALITY_WRAPPER.to_string());
        }
        for arg in template {
            argv.push(expand(arg, |var| self.vars.get(var).cloned())?);
        }

        Ok(argv)
    }
}
