//! Filesystem-backed artifact store
//!
//! Objects are files below a root directory. Prefix renames are directory
//! renames, which are atomic on one filesystem, so a reader either sees the
//! previous complete set, nothing, or the new complete set.

use async_trait::async_trait;
use kiln_core::error::StoreError;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ArtifactStore, ObjectMeta, STAGING_PREFIX, join_key, sha256_file};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let key = join_key(&[key]);
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err(parent))?;
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn location(&self, key: &str) -> String {
        self.path(key).to_string_lossy().to_string()
    }

    async fn put(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        let dest = self.path(key);
        ensure_parent(&dest).await?;
        tokio::fs::copy(local, &dest).await.map_err(io_err(local))?;
        debug!("Stored {} at {}", local.display(), dest.display());
        Ok(())
    }

    async fn put_bytes(&self, bytes: &[u8], key: &str) -> Result<(), StoreError> {
        let dest = self.path(key);
        ensure_parent(&dest).await?;
        tokio::fs::write(&dest, bytes).await.map_err(io_err(&dest))
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.path(key);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };

        let sha256 = sha256_file(&path).await.map_err(io_err(&path))?;
        Ok(Some(ObjectMeta {
            size: metadata.len(),
            sha256: Some(sha256),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.path(prefix);
        if !tokio::fs::try_exists(&base).await.map_err(io_err(&base))? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        let src = self.path(key);
        if !tokio::fs::try_exists(&src).await.map_err(io_err(&src))? {
            return Err(StoreError::NotFound(self.location(key)));
        }
        ensure_parent(local).await?;
        tokio::fs::copy(&src, local).await.map_err(io_err(&src))?;
        Ok(())
    }

    async fn rename_prefix(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let src = self.path(from);
        let dest = self.path(to);
        ensure_parent(&dest).await?;

        // Move the previous set aside first; rename cannot replace a non-empty directory
        let displaced = if tokio::fs::try_exists(&dest).await.map_err(io_err(&dest))? {
            let aside = self.path(&join_key(&[
                STAGING_PREFIX,
                &format!("replaced-{}", uuid::Uuid::new_v4().simple()),
            ]));
            ensure_parent(&aside).await?;
            tokio::fs::rename(&dest, &aside)
                .await
                .map_err(io_err(&dest))?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(&src, &dest).await {
            // Put the previous set back so the tag keeps its last good publication
            if let Some(aside) = &displaced {
                let _ = tokio::fs::rename(aside, &dest).await;
            }
            return Err(io_err(&src)(e));
        }

        if let Some(aside) = displaced {
            if let Err(e) = tokio::fs::remove_dir_all(&aside).await {
                debug!("Failed to remove replaced set {}: {}", aside.display(), e);
            }
        }

        debug!("Renamed {} to {}", src.display(), dest.display());
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let path = self.path(prefix);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                tokio::fs::remove_dir_all(&path).await.map_err(io_err(&path))
            }
            Ok(_) => tokio::fs::remove_file(&path).await.map_err(io_err(&path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}
