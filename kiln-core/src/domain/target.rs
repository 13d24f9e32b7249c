//! Target domain types
//!
//! A target is one entry of the build matrix: an (OS, architecture,
//! package format) tuple plus everything needed to build it in isolation.
//! Targets are immutable once the matrix has been parsed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::stage::{StageDefinition, StageUser};

/// Returned when a matrix field holds a value outside its vocabulary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {field} '{value}' (expected one of: {expected})")]
pub struct UnknownValue {
    pub field: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Operating system family of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Darwin,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Darwin => write!(f, "darwin"),
        }
    }
}

impl FromStr for OsFamily {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(OsFamily::Linux),
            "darwin" | "osx" | "macos" => Ok(OsFamily::Darwin),
            other => Err(UnknownValue {
                field: "os",
                value: other.to_string(),
                expected: "linux, darwin",
            }),
        }
    }
}

/// CPU architecture a target's packages are built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    I386,
}

impl Arch {
    pub fn is_32bit(&self) -> bool {
        matches!(self, Arch::I386)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Amd64 => write!(f, "amd64"),
            Arch::I386 => write!(f, "i386"),
        }
    }
}

impl FromStr for Arch {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" | "64" => Ok(Arch::Amd64),
            "i386" | "x86" | "32" => Ok(Arch::I386),
            other => Err(UnknownValue {
                field: "arch",
                value: other.to_string(),
                expected: "amd64, i386",
            }),
        }
    }
}

/// Package format produced by a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Deb,
    Rpm,
    None,
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageFormat::Deb => write!(f, "deb"),
            PackageFormat::Rpm => write!(f, "rpm"),
            PackageFormat::None => write!(f, "none"),
        }
    }
}

impl FromStr for PackageFormat {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deb" => Ok(PackageFormat::Deb),
            "rpm" => Ok(PackageFormat::Rpm),
            "none" => Ok(PackageFormat::None),
            other => Err(UnknownValue {
                field: "format",
                value: other.to_string(),
                expected: "deb, rpm, none",
            }),
        }
    }
}

/// Container settings for a target built in container mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference (e.g., docker.io/library/ubuntu:xenial)
    pub image: String,
    /// Unprivileged user stages run as; `None` keeps the image default
    pub user: Option<String>,
}

/// Where a target's stages execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionMode {
    Host,
    Container(ContainerSpec),
}

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Host => "host",
            ExecutionMode::Container(_) => "container",
        }
    }
}

/// A command run while provisioning the environment, before any stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupCommand {
    pub command: Vec<String>,
    pub user: StageUser,
}

/// An upstream artifact dependency checked before a pipeline starts
///
/// The published artifacts of `tag` are fetched into `dest`, relative to
/// the requiring target's staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub tag: String,
    pub dest: String,
}

/// One build matrix entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Unique tag; also names the remote publication path
    pub tag: String,
    pub os: OsFamily,
    pub arch: Arch,
    pub format: PackageFormat,
    pub mode: ExecutionMode,
    /// Variables injected into the environment and available to command templates
    pub env: BTreeMap<String, String>,
    /// Host variables forwarded by name into the environment (secrets)
    pub passthrough: Vec<String>,
    pub setup: Vec<SetupCommand>,
    pub stages: Vec<StageDefinition>,
    pub requires: Vec<Precondition>,
}

/// Whether `tag` can name a target
///
/// Tags become path components of staging directories and store keys, so
/// they use only `[A-Za-z0-9_.-]` and may not start with `.`; that rules
/// out `.`, `..` and hidden names such as the store's staging prefix.
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && !tag.starts_with('.')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl Target {
    /// Returns the stage definition names in declaration order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the container spec if this target runs in container mode
    pub fn container(&self) -> Option<&ContainerSpec> {
        match &self.mode {
            ExecutionMode::Container(spec) => Some(spec),
            ExecutionMode::Host => None,
        }
    }

    /// Short human description, e.g. `linux/i386 deb (container)`
    pub fn describe(&self) -> String {
        format!(
            "{}/{} {} ({})",
            self.os,
            self.arch,
            self.format,
            self.mode.name()
        )
    }
}
