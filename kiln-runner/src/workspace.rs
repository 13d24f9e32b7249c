//! Per-target workspace on the host
//!
//! Every target gets its own staging directory under the work dir; the
//! source checkout is shared. Staging directories are emptied at the start
//! of each run so stale artifacts of an earlier run can never be captured.

use kiln_core::domain::target::is_valid_tag;
use kiln_core::error::ProvisionError;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute path of the source checkout
    pub source: PathBuf,
    /// Absolute path of this target's local staging directory
    pub staging: PathBuf,
}

impl Workspace {
    /// Creates a fresh staging directory for `tag` under `work_dir`
    pub async fn prepare(work_dir: &Path, source: &Path, tag: &str) -> Result<Self, ProvisionError> {
        if !is_valid_tag(tag) {
            return Err(ProvisionError::InvalidTag {
                tag: tag.to_string(),
            });
        }

        let source = tokio::fs::canonicalize(source)
            .await
            .map_err(|source_err| ProvisionError::Workspace {
                path: source.to_path_buf(),
                source: source_err,
            })?;

        let staging = work_dir.join(tag).join("artifacts");
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| ProvisionError::Workspace {
                    path: staging.clone(),
                    source: e,
                })?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ProvisionError::Workspace {
                path: staging.clone(),
                source: e,
            })?;
        let staging = tokio::fs::canonicalize(&staging)
            .await
            .map_err(|e| ProvisionError::Workspace {
                path: staging.clone(),
                source: e,
            })?;

        debug!(
            "Prepared workspace for {}: source={}, staging={}",
            tag,
            source.display(),
            staging.display()
        );

        Ok(Self { source, staging })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_clears_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("checkout");
        std::fs::create_dir_all(&source).unwrap();
        let work = dir.path().join("work");

        let ws = Workspace::prepare(&work, &source, "ubuntu_64bit").await.unwrap();
        std::fs::write(ws.staging.join("old.deb"), b"stale").unwrap();

        let ws = Workspace::prepare(&work, &source, "ubuntu_64bit").await.unwrap();
        assert!(ws.staging.is_dir());
        assert!(!ws.staging.join("old.deb").exists());
        assert!(ws.source.is_absolute());
    }

    #[tokio::test]
    async fn test_targets_get_separate_staging() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");

        let a = Workspace::prepare(&work, dir.path(), "a").await.unwrap();
        let b = Workspace::prepare(&work, dir.path(), "b").await.unwrap();
        assert_ne!(a.staging, b.staging);
        assert_eq!(a.source, b.source);
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = Workspace::prepare(dir.path(), &dir.path().join("nope"), "a")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Workspace { .. }));
    }

    #[tokio::test]
    async fn test_tag_cannot_escape_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let outside = dir.path().join("artifacts");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), b"precious").unwrap();

        for tag in ["..", ".", ".staging"] {
            let err = Workspace::prepare(&work, dir.path(), tag).await.unwrap_err();
            assert!(matches!(err, ProvisionError::InvalidTag { .. }));
        }
        assert!(outside.join("keep.txt").exists());
    }
}
