//! Publication records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One object of a published artifact set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedObject {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Proof that a target's full artifact set is visible under its tag
///
/// Only ever created for a run that succeeded through every stage. The
/// latest successful publication of a tag replaces the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub tag: String,
    /// Final remote location of the artifact set
    pub remote_path: String,
    pub objects: Vec<PublishedObject>,
    /// sha256 over the sorted `name:sha256` lines of every object
    pub checksum: String,
    pub published_at: DateTime<Utc>,
    pub run_id: Uuid,
}
