//! Artifact publisher
//!
//! Uploads a succeeded run's staged artifact set to a temporary prefix,
//! verifies every object, then promotes the prefix to the target's tag in
//! one rename. A failed publish removes the temporary prefix and leaves the
//! tag's previous publication untouched.

use chrono::Utc;
use kiln_core::domain::publication::{PublicationRecord, PublishedObject};
use kiln_core::domain::run::{PipelineRun, RunStatus};
use kiln_core::error::{PublishError, StoreError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::{ArtifactStore, STAGING_PREFIX, join_key, sha256_file};

/// Name of the publication record stored with every artifact set
pub const MANIFEST_NAME: &str = "MANIFEST.json";

/// A staged artifact ready for upload
#[derive(Debug, Clone)]
struct LocalObject {
    path: PathBuf,
    object: PublishedObject,
}

pub struct Publisher {
    store: Arc<dyn ArtifactStore>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Publishes a run's artifact set under its tag
    ///
    /// Refuses runs that did not succeed through every stage in order, and
    /// runs with nothing to publish.
    pub async fn publish(&self, run: &PipelineRun) -> Result<PublicationRecord, PublishError> {
        check_eligible(run)?;

        let tag = &run.tag;
        let objects = self.hash_artifacts(run).await?;

        let upload_id = format!("{}-{}", tag, uuid::Uuid::new_v4().simple());
        let staging_key = join_key(&[STAGING_PREFIX, upload_id.as_str()]);
        let record = PublicationRecord {
            tag: tag.clone(),
            remote_path: self.store.location(tag),
            checksum: combined_checksum(objects.iter().map(|o| &o.object)),
            objects: objects.iter().map(|o| o.object.clone()).collect(),
            published_at: Utc::now(),
            run_id: run.id,
        };

        info!(
            "Publishing {} object(s) of {} via {}",
            objects.len(),
            tag,
            self.store.location(&staging_key)
        );

        if let Err(e) = self.upload_and_verify(&staging_key, &objects, &record).await {
            self.discard(&staging_key).await;
            return Err(e);
        }

        if let Err(source) = self.store.rename_prefix(&staging_key, tag).await {
            self.discard(&staging_key).await;
            return Err(PublishError::Promote {
                tag: tag.clone(),
                source,
            });
        }

        info!("Published {} to {}", tag, record.remote_path);
        Ok(record)
    }

    async fn hash_artifacts(&self, run: &PipelineRun) -> Result<Vec<LocalObject>, PublishError> {
        let mut objects: Vec<LocalObject> = Vec::with_capacity(run.artifacts.len());

        for path in &run.artifacts {
            let read_err = |source| PublishError::Read {
                path: path.clone(),
                source,
            };
            let size = tokio::fs::metadata(path).await.map_err(read_err)?.len();
            let sha256 = sha256_file(path).await.map_err(read_err)?;
            let name = object_name(path, run.staging_dir.as_deref());

            if name == MANIFEST_NAME || objects.iter().any(|o| o.object.name == name) {
                return Err(PublishError::NotEligible {
                    tag: run.tag.clone(),
                    reason: format!("artifact name '{}' is not unique", name),
                });
            }

            objects.push(LocalObject {
                path: path.clone(),
                object: PublishedObject { name, size, sha256 },
            });
        }

        Ok(objects)
    }

    async fn upload_and_verify(
        &self,
        staging_key: &str,
        objects: &[LocalObject],
        record: &PublicationRecord,
    ) -> Result<(), PublishError> {
        let upload_err = |source| PublishError::Upload {
            tag: record.tag.clone(),
            source,
        };

        for local in objects {
            let key = join_key(&[staging_key, local.object.name.as_str()]);
            debug!("Uploading {} to {}", local.path.display(), key);
            self.store.put(&local.path, &key).await.map_err(upload_err)?;
        }

        let manifest = serde_json::to_vec_pretty(record)
            .map_err(|e| upload_err(StoreError::Parse(e.to_string())))?;
        self.store
            .put_bytes(&manifest, &join_key(&[staging_key, MANIFEST_NAME]))
            .await
            .map_err(upload_err)?;

        for local in objects {
            let expected = &local.object;
            let key = join_key(&[staging_key, expected.name.as_str()]);
            let meta = self
                .store
                .stat(&key)
                .await
                .map_err(upload_err)?
                .ok_or_else(|| PublishError::Verification {
                    object: expected.name.clone(),
                    expected: format!("{} bytes", expected.size),
                    actual: "missing".to_string(),
                })?;

            if meta.size != expected.size {
                return Err(PublishError::Verification {
                    object: expected.name.clone(),
                    expected: format!("{} bytes", expected.size),
                    actual: format!("{} bytes", meta.size),
                });
            }
            if let Some(actual) = meta.sha256 {
                if actual != expected.sha256 {
                    return Err(PublishError::Verification {
                        object: expected.name.clone(),
                        expected: format!("sha256 {}", expected.sha256),
                        actual: format!("sha256 {}", actual),
                    });
                }
            }
        }

        Ok(())
    }

    /// Best-effort removal of a staged upload
    async fn discard(&self, staging_key: &str) {
        if let Err(e) = self.store.remove_prefix(staging_key).await {
            warn!(
                "Failed to clean up {}: {}",
                self.store.location(staging_key),
                e
            );
        }
    }
}

fn check_eligible(run: &PipelineRun) -> Result<(), PublishError> {
    if run.status() != RunStatus::Succeeded {
        return Err(PublishError::NotEligible {
            tag: run.tag.clone(),
            reason: format!("run ended {}", run.status()),
        });
    }
    if !run.is_complete() {
        return Err(PublishError::NotEligible {
            tag: run.tag.clone(),
            reason: "not every stage ran and passed in order".to_string(),
        });
    }
    if run.artifacts.is_empty() {
        return Err(PublishError::NoArtifacts {
            tag: run.tag.clone(),
        });
    }
    Ok(())
}

/// Object name of an artifact: its path below the staging directory, or
/// its file name when it lives elsewhere
fn object_name(path: &Path, staging: Option<&Path>) -> String {
    match staging.and_then(|dir| path.strip_prefix(dir).ok()) {
        Some(relative) => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}

/// sha256 over the sorted `name:sha256` lines of every object
pub fn combined_checksum<'a>(objects: impl Iterator<Item = &'a PublishedObject>) -> String {
    let mut lines: Vec<String> = objects
        .map(|o| format!("{}:{}\n", o.name, o.sha256))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}
