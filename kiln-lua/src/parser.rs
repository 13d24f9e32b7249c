//! Matrix parser
//!
//! Evaluates a matrix definition in the sandbox and extracts the targets.
//! The file must return a table with a `targets` array; see the crate docs
//! of `kiln-cli` for the full field reference.

use anyhow::{Context, Result};
use kiln_core::domain::stage::{StageDefinition, StageUser};
use kiln_core::domain::target::{
    Arch, ContainerSpec, ExecutionMode, OsFamily, PackageFormat, Precondition, SetupCommand,
    Target,
};
use mlua::{Table, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::sandbox::create_sandbox;
use crate::validate::validate_matrix;

/// Parse and validate a matrix from Lua source code
///
/// # Example
/// ```no_run
/// use kiln_lua::parser::parse_matrix;
///
/// let source = r#"
///     return matrix.define {
///         targets = {
///             matrix.target {
///                 tag = "ubuntu_64bit", os = "linux", arch = "amd64", format = "deb",
///                 container = { image = "ubuntu:xenial" },
///                 stages = {
///                     { name = "build", command = {"make", "deb"}, artifacts = {"*.deb"} },
///                 },
///             },
///         },
///     }
/// "#;
///
/// let targets = parse_matrix(source)?;
/// assert_eq!(targets[0].tag, "ubuntu_64bit");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_matrix(source: &str) -> Result<Vec<Target>> {
    let lua = create_sandbox().context("Failed to create matrix sandbox")?;

    let matrix: Table = lua
        .load(source)
        .set_name("matrix")
        .eval()
        .context("Failed to evaluate matrix definition")?;

    let targets_table: Table = matrix
        .get("targets")
        .context("Matrix must have a 'targets' field")?;

    let mut targets = Vec::new();
    for (index, entry) in targets_table.sequence_values::<Table>().enumerate() {
        let table = entry.with_context(|| format!("Target #{} must be a table", index + 1))?;
        targets.push(parse_target(index + 1, &table)?);
    }

    if targets.is_empty() {
        anyhow::bail!("Matrix must define at least one target");
    }

    validate_matrix(&targets)?;
    debug!("Parsed matrix with {} target(s)", targets.len());

    Ok(targets)
}

/// Read, parse and validate a matrix file
pub fn parse_matrix_file(path: &Path) -> Result<Vec<Target>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read matrix file {}", path.display()))?;
    parse_matrix(&source).with_context(|| format!("Invalid matrix file {}", path.display()))
}

fn parse_target(index: usize, table: &Table) -> Result<Target> {
    let tag: String = table
        .get("tag")
        .with_context(|| format!("Target #{} must have a 'tag' field", index))?;

    parse_target_fields(&tag, table).with_context(|| format!("Invalid target '{}'", tag))
}

fn parse_target_fields(tag: &str, table: &Table) -> Result<Target> {
    let os: String = table.get("os").context("Target must have an 'os' field")?;
    let arch: String = table
        .get("arch")
        .context("Target must have an 'arch' field")?;
    let format: Option<String> = table.get("format").context("Field 'format' must be a string")?;

    let os: OsFamily = os.parse()?;
    let arch: Arch = arch.parse()?;
    let format = match format {
        Some(format) => format.parse()?,
        None => PackageFormat::None,
    };

    let mode = match table.get::<Option<Table>>("container")? {
        Some(container) => ExecutionMode::Container(parse_container(&container)?),
        None => ExecutionMode::Host,
    };

    let stages_table: Table = table
        .get("stages")
        .context("Target must have a 'stages' field")?;
    let mut stages = Vec::new();
    for entry in stages_table.sequence_values::<Table>() {
        let stage = entry.context("Failed to read stage entry")?;
        stages.push(parse_stage(&stage)?);
    }

    Ok(Target {
        tag: tag.to_string(),
        os,
        arch,
        format,
        mode,
        env: parse_env(table)?,
        passthrough: parse_strings(table, "passthrough")?,
        setup: parse_setup(table)?,
        stages,
        requires: parse_requires(table)?,
    })
}

fn parse_container(table: &Table) -> Result<ContainerSpec> {
    let image: String = table
        .get("image")
        .context("Container must have an 'image' field")?;
    let user: Option<String> = table
        .get("user")
        .context("Container field 'user' must be a string")?;

    Ok(ContainerSpec { image, user })
}

/// Parse the 'env' field (string keys, string or number values)
fn parse_env(table: &Table) -> Result<BTreeMap<String, String>> {
    let env_value: Value = table.get("env").unwrap_or(Value::Nil);

    match env_value {
        Value::Nil => Ok(BTreeMap::new()),
        Value::Table(env) => {
            let mut vars = BTreeMap::new();
            for pair in env.pairs::<String, String>() {
                let (key, value) = pair.context("Field 'env' must map names to strings")?;
                vars.insert(key, value);
            }
            Ok(vars)
        }
        _ => Err(anyhow::anyhow!("Field 'env' must be a table")),
    }
}

/// Parse an optional array of strings
fn parse_strings(table: &Table, field: &str) -> Result<Vec<String>> {
    let value: Value = table.get(field).unwrap_or(Value::Nil);

    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Table(items) => {
            let mut strings = Vec::new();
            for item in items.sequence_values::<String>() {
                strings.push(item.with_context(|| format!("Failed to read '{}' entry", field))?);
            }
            Ok(strings)
        }
        _ => Err(anyhow::anyhow!("Field '{}' must be an array of strings", field)),
    }
}

fn parse_user(table: &Table, default: StageUser) -> Result<StageUser> {
    let user: Option<String> = table.get("user").context("Field 'user' must be a string")?;
    match user {
        Some(user) => Ok(user.parse()?),
        None => Ok(default),
    }
}

/// Parse the 'setup' field
///
/// Entries are either a bare argv array or `{ command = {...}, user = "..." }`.
/// Setup commands run as root unless they say otherwise.
fn parse_setup(table: &Table) -> Result<Vec<SetupCommand>> {
    let setup_value: Value = table.get("setup").unwrap_or(Value::Nil);

    let setup = match setup_value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(setup) => setup,
        _ => anyhow::bail!("Field 'setup' must be an array of commands"),
    };

    let mut commands = Vec::new();
    for entry in setup.sequence_values::<Table>() {
        let entry = entry.context("Failed to read setup entry")?;
        let command = if entry.contains_key("command")? {
            SetupCommand {
                command: parse_strings(&entry, "command")?,
                user: parse_user(&entry, StageUser::Root)?,
            }
        } else {
            let mut argv = Vec::new();
            for arg in entry.sequence_values::<String>() {
                argv.push(arg.context("Setup command arguments must be strings")?);
            }
            SetupCommand {
                command: argv,
                user: StageUser::Root,
            }
        };
        commands.push(command);
    }

    Ok(commands)
}

fn parse_stage(table: &Table) -> Result<StageDefinition> {
    let name: String = table
        .get("name")
        .context("Stage must have a 'name' field")?;

    if !table.contains_key("command")? {
        anyhow::bail!("Stage '{}' must have a 'command' field", name);
    }

    Ok(StageDefinition {
        command: parse_strings(table, "command")
            .with_context(|| format!("Invalid command for stage '{}'", name))?,
        user: parse_user(table, StageUser::Build)?,
        artifacts: parse_strings(table, "artifacts")?,
        name,
    })
}

fn parse_requires(table: &Table) -> Result<Vec<Precondition>> {
    let requires_value: Value = table.get("requires").unwrap_or(Value::Nil);

    let requires = match requires_value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(requires) => requires,
        _ => anyhow::bail!("Field 'requires' must be an array"),
    };

    let mut preconditions = Vec::new();
    for entry in requires.sequence_values::<Table>() {
        let entry = entry.context("Failed to read requires entry")?;
        let tag: String = entry
            .get("tag")
            .context("Requires entry must have a 'tag' field")?;
        let dest: Option<String> = entry.get("dest").context("Field 'dest' must be a string")?;
        preconditions.push(Precondition {
            dest: dest.unwrap_or_else(|| format!("deps/{}", tag)),
            tag,
        });
    }

    Ok(preconditions)
}
