//! Google Cloud Storage through the `gsutil` command line tool

use async_trait::async_trait;
use kiln_core::error::StoreError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ArtifactStore, ObjectMeta, join_key};

const GSUTIL: &str = "gsutil";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);
const NO_MATCH: &str = "matched no objects";

#[derive(Debug, Clone)]
pub struct GsutilStore {
    base: String,
}

impl GsutilStore {
    /// `base` is a `gs://bucket[/prefix]` URL without a trailing slash
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn url(&self, key: &str) -> String {
        let key = join_key(&[key]);
        if key.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, key)
        }
    }

    async fn gsutil(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, StoreError> {
        let command_line = format!("{} {}", GSUTIL, args.join(" "));
        debug!("Running {}", command_line);

        let mut command = Command::new(GSUTIL);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| StoreError::Spawn {
            program: GSUTIL.to_string(),
            source,
        })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)
                .await
                .map_err(|source| StoreError::Spawn {
                    program: GSUTIL.to_string(),
                    source,
                })?;
            // Closing stdin ends the upload stream
            drop(pipe);
        }

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| StoreError::Command {
                command: command_line.clone(),
                exit_code: 124,
                stderr: format!("timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            })?
            .map_err(|source| StoreError::Spawn {
                program: GSUTIL.to_string(),
                source,
            })?;

        Ok(Output {
            command_line,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn checked(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, StoreError> {
        let output = self.gsutil(args, stdin).await?;
        if output.exit_code != 0 {
            return Err(output.into_error());
        }
        Ok(output)
    }
}

struct Output {
    command_line: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl Output {
    fn no_match(&self) -> bool {
        self.exit_code != 0 && self.stderr.contains(NO_MATCH)
    }

    fn into_error(self) -> StoreError {
        StoreError::Command {
            command: self.command_line,
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Size of the object from `gsutil ls -l` output
fn parse_size(listing: &str, url: &str) -> Result<Option<u64>, StoreError> {
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == 3 && fields[2] == url {
            let size = fields[0]
                .parse()
                .map_err(|_| StoreError::Parse(format!("bad size in '{}'", line.trim())))?;
            return Ok(Some(size));
        }
    }
    Ok(None)
}

/// Object keys relative to `base` from a recursive `gsutil ls` listing
fn parse_listing(listing: &str, base: &str) -> Vec<String> {
    let base = format!("{}/", base.trim_end_matches('/'));
    let mut keys: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.ends_with('/') && !line.ends_with(':'))
        .filter_map(|line| line.strip_prefix(&base))
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[async_trait]
impl ArtifactStore for GsutilStore {
    fn location(&self, key: &str) -> String {
        self.url(key)
    }

    async fn put(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        let local = local.to_string_lossy().to_string();
        let url = self.url(key);
        self.checked(&["-q", "cp", local.as_str(), url.as_str()], None)
            .await?;
        Ok(())
    }

    async fn put_bytes(&self, bytes: &[u8], key: &str) -> Result<(), StoreError> {
        let url = self.url(key);
        self.checked(&["-q", "cp", "-", url.as_str()], Some(bytes))
            .await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let url = self.url(key);
        let output = self.gsutil(&["ls", "-l", url.as_str()], None).await?;
        if output.no_match() {
            return Ok(None);
        }
        if output.exit_code != 0 {
            return Err(output.into_error());
        }

        // gsutil only reports md5/crc32c, so the checksum is left to the manifest
        Ok(parse_size(&output.stdout, &url)?.map(|size| ObjectMeta { size, sha256: None }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.url(prefix);
        let pattern = format!("{}/**", base);
        let output = self.gsutil(&["ls", pattern.as_str()], None).await?;
        if output.no_match() {
            return Ok(Vec::new());
        }
        if output.exit_code != 0 {
            return Err(output.into_error());
        }
        Ok(parse_listing(&output.stdout, &base))
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let url = self.url(key);
        let dest = local.to_string_lossy().to_string();
        let output = self
            .gsutil(&["-q", "cp", url.as_str(), dest.as_str()], None)
            .await?;
        if output.no_match() {
            return Err(StoreError::NotFound(url));
        }
        if output.exit_code != 0 {
            return Err(output.into_error());
        }
        Ok(())
    }

    async fn rename_prefix(&self, from: &str, to: &str) -> Result<(), StoreError> {
        // gsutil has no atomic replace; clear the destination, then move
        self.remove_prefix(to).await?;
        let (src, dest) = (self.url(from), self.url(to));
        self.checked(&["-m", "-q", "mv", src.as_str(), dest.as_str()], None)
            .await?;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let url = self.url(prefix);
        let output = self
            .gsutil(&["-m", "-q", "rm", "-r", url.as_str()], None)
            .await?;
        if output.exit_code != 0 && !output.no_match() {
            return Err(output.into_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let store = GsutilStore::new("gs://releases/builds");
        assert_eq!(store.url("tag/pkg.deb"), "gs://releases/builds/tag/pkg.deb");
        assert_eq!(store.url(""), "gs://releases/builds");
    }

    #[test]
    fn test_parse_size() {
        let listing = "\
      1024  2026-01-01T10:00:00Z  gs://b/tag/pkg.deb
TOTAL: 1 objects, 1024 bytes (1 KiB)
";
        assert_eq!(parse_size(listing, "gs://b/tag/pkg.deb").unwrap(), Some(1024));
        assert_eq!(parse_size(listing, "gs://b/tag/other").unwrap(), None);

        let bad = "  lots  2026-01-01T10:00:00Z  gs://b/x\n";
        assert!(parse_size(bad, "gs://b/x").is_err());
    }

    #[test]
    fn test_parse_listing() {
        let listing = "\
gs://b/tag/pkg.deb
gs://b/tag/deps/lib.tar.gz
gs://b/tag/
gs://b/other/x
";
        assert_eq!(
            parse_listing(listing, "gs://b/tag"),
            vec!["deps/lib.tar.gz".to_string(), "pkg.deb".to_string()]
        );
    }
}
