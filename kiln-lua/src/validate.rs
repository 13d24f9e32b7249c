//! Matrix validation
//!
//! Checks everything that can be known before any environment exists, so
//! a bad matrix fails as a whole instead of as a scattering of stage
//! failures.

use anyhow::{Context, Result};
use kiln_core::domain::target::{Target, is_valid_tag};
use kiln_core::template::{BUILTIN_VARS, placeholders};
use std::collections::{HashMap, HashSet};

/// Validate a parsed matrix
///
/// # Errors
/// Returns an error if:
/// - Two targets share a tag, or a tag has characters outside `[A-Za-z0-9_.-]`
///   or starts with `.`
/// - An `env` entry redefines a built-in variable such as `KILN_TAG`
/// - A target has no stages, duplicate stage names, or an empty command
/// - A command references a variable the target does not provide
/// - A target requires itself, or the in-matrix `requires` graph has a cycle
pub fn validate_matrix(targets: &[Target]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.tag.as_str()) {
            anyhow::bail!("Duplicate target tag '{}'", target.tag);
        }
        validate_target(target).with_context(|| format!("Invalid target '{}'", target.tag))?;
    }

    check_dependency_cycles(targets)
}

fn validate_target(target: &Target) -> Result<()> {
    if !is_valid_tag(&target.tag) {
        anyhow::bail!("Tag must be non-empty, use only [A-Za-z0-9_.-] and not start with '.'");
    }

    if target.stages.is_empty() {
        anyhow::bail!("Target must have at least one stage");
    }

    if let Some(name) = target.env.keys().find(|k| BUILTIN_VARS.contains(&k.as_str())) {
        anyhow::bail!("env entry '{}' would override a built-in variable", name);
    }

    let known: HashSet<&str> = BUILTIN_VARS
        .iter()
        .copied()
        .chain(target.env.keys().map(String::as_str))
        .collect();

    let mut names = HashSet::new();
    for stage in &target.stages {
        if !names.insert(stage.name.as_str()) {
            anyhow::bail!("Duplicate stage name '{}'", stage.name);
        }
        check_command(&stage.command, &known)
            .with_context(|| format!("Invalid command for stage '{}'", stage.name))?;
    }

    for (idx, setup) in target.setup.iter().enumerate() {
        check_command(&setup.command, &known)
            .with_context(|| format!("Invalid setup command #{}", idx + 1))?;
    }

    for requirement in &target.requires {
        if requirement.tag == target.tag {
            anyhow::bail!("Target cannot require its own artifacts");
        }
        if requirement.dest.starts_with('/') || requirement.dest.split('/').any(|p| p == "..") {
            anyhow::bail!(
                "Destination '{}' must stay inside the staging directory",
                requirement.dest
            );
        }
    }

    Ok(())
}

fn check_command(command: &[String], known: &HashSet<&str>) -> Result<()> {
    if command.is_empty() {
        anyhow::bail!("Command must not be empty");
    }

    for arg in command {
        for name in placeholders(arg)? {
            if !known.contains(name.as_str()) {
                anyhow::bail!(
                    "Unknown variable ${{{}}} in '{}' (passthrough variables are not substituted)",
                    name,
                    arg
                );
            }
        }
    }

    Ok(())
}

/// Reject cycles among requirements that name targets of this matrix
fn check_dependency_cycles(targets: &[Target]) -> Result<()> {
    let graph: HashMap<&str, Vec<&str>> = targets
        .iter()
        .map(|t| {
            (
                t.tag.as_str(),
                t.requires.iter().map(|r| r.tag.as_str()).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        tag: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(tag) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(tag);
                anyhow::bail!("Dependency cycle: {}", path.join(" -> "));
            }
            None => {}
        }

        marks.insert(tag, Mark::Visiting);
        path.push(tag);
        for dep in graph.get(tag).into_iter().flatten() {
            // Tags outside the matrix are plain remote fetches
            if graph.contains_key(*dep) {
                visit(*dep, graph, marks, path)?;
            }
        }
        path.pop();
        marks.insert(tag, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for target in targets {
        visit(target.tag.as_str(), &graph, &mut marks, &mut Vec::new())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::stage::StageDefinition;
    use kiln_core::domain::target::{Arch, ExecutionMode, OsFamily, PackageFormat, Precondition};
    use std::collections::BTreeMap;

    fn target(tag: &str, requires: &[&str]) -> Target {
        Target {
            tag: tag.to_string(),
            os: OsFamily::Linux,
            arch: Arch::Amd64,
            format: PackageFormat::Deb,
            mode: ExecutionMode::Host,
            env: BTreeMap::from([("BUCKET".to_string(), "releases".to_string())]),
            passthrough: vec!["TOKEN".to_string()],
            setup: vec![],
            stages: vec![StageDefinition::new(
                "build",
                vec!["make".into(), "${KILN_TAG}".into(), "${BUCKET}".into()],
            )],
            requires: requires
                .iter()
                .map(|t| Precondition {
                    tag: t.to_string(),
                    dest: format!("deps/{}", t),
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_matrix() {
        let targets = vec![target("a", &[]), target("b", &["a", "remote_only"])];
        assert!(validate_matrix(&targets).is_ok());
    }

    #[test]
    fn test_duplicate_tag() {
        let err = validate_matrix(&[target("a", &[]), target("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("Duplicate target tag"));
    }

    #[test]
    fn test_bad_tag_characters() {
        assert!(validate_matrix(&[target("ubuntu 64", &[])]).is_err());
    }

    #[test]
    fn test_dot_tags_rejected() {
        for tag in [".", "..", ".staging", ".hidden"] {
            let err = validate_matrix(&[target(tag, &[])]).unwrap_err();
            assert!(
                format!("{:#}", err).contains("not start with '.'"),
                "tag {tag} was accepted"
            );
        }
        assert!(validate_matrix(&[target("centos-7.x86_64", &[])]).is_ok());
    }

    #[test]
    fn test_env_cannot_override_builtins() {
        let mut t = target("a", &[]);
        t.env
            .insert("KILN_ARTIFACT_DIR".to_string(), "/tmp/elsewhere".to_string());
        let err = validate_matrix(&[t]).unwrap_err();
        assert!(format!("{:#}", err).contains("KILN_ARTIFACT_DIR"));
    }

    #[test]
    fn test_unknown_variable() {
        let mut t = target("a", &[]);
        t.stages[0].command.push("${MISSING}".to_string());
        let err = validate_matrix(&[t]).unwrap_err();
        assert!(format!("{:#}", err).contains("MISSING"));
    }

    #[test]
    fn test_passthrough_not_substitutable() {
        let mut t = target("a", &[]);
        t.stages[0].command.push("--token=${TOKEN}".to_string());
        assert!(validate_matrix(&[t]).is_err());
    }

    #[test]
    fn test_duplicate_stage() {
        let mut t = target("a", &[]);
        t.stages.push(t.stages[0].clone());
        let err = validate_matrix(&[t]).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate stage name"));
    }

    #[test]
    fn test_self_requirement() {
        assert!(validate_matrix(&[target("a", &["a"])]).is_err());
    }

    #[test]
    fn test_escaping_destination() {
        let mut t = target("b", &["a"]);
        t.requires[0].dest = "../outside".to_string();
        assert!(validate_matrix(&[target("a", &[]), t]).is_err());
    }

    #[test]
    fn test_dependency_cycle() {
        let targets = vec![target("a", &["c"]), target("b", &["a"]), target("c", &["b"])];
        let err = validate_matrix(&targets).unwrap_err();
        assert!(err.to_string().contains("Dependency cycle"));
    }
}
