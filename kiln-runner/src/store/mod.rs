//! Remote artifact stores
//!
//! The store is the only state shared between targets, and only at
//! publish time. Keys are `/`-separated paths relative to the store root.

mod gsutil;
mod local;

pub use gsutil::GsutilStore;
pub use local::LocalStore;

use async_trait::async_trait;
use kiln_core::error::StoreError;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Prefix under which uploads are staged before promotion
pub const STAGING_PREFIX: &str = ".staging";

/// Size and, when the store can tell, checksum of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub sha256: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Externally meaningful location of a key (URL or path)
    fn location(&self, key: &str) -> String;

    /// Uploads a local file to `key`
    async fn put(&self, local: &Path, key: &str) -> Result<(), StoreError>;

    /// Uploads an in-memory object to `key`
    async fn put_bytes(&self, bytes: &[u8], key: &str) -> Result<(), StoreError>;

    /// Metadata of an object, `None` if it does not exist
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    /// Keys below `prefix`, relative to it, sorted; empty if the prefix is absent
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Downloads `key` to a local file, creating parent directories
    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreError>;

    /// Moves everything under `from` to `to`, replacing what `to` held
    async fn rename_prefix(&self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Removes everything under `prefix`; an absent prefix is not an error
    async fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}

/// Opens a store from a URL
///
/// Supported schemes:
/// - `file:///path/to/dir` - a local or mounted directory
/// - `gs://bucket/optional/prefix` - Google Cloud Storage through `gsutil`
pub fn open_store(url: &str) -> Result<Arc<dyn ArtifactStore>, StoreError> {
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() || !path.starts_with('/') {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        return Ok(Arc::new(LocalStore::new(path)));
    }

    if let Some(rest) = url.strip_prefix("gs://") {
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        return Ok(Arc::new(GsutilStore::new(format!("gs://{}", rest))));
    }

    Err(StoreError::InvalidUrl(url.to_string()))
}

/// Joins key segments with `/`, ignoring empty ones
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Hex sha256 of a local file, computed off the async runtime
pub async fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}
