//! Artifact storage abstraction.
//!
//! Artifacts are scoped to a single run: the build stage stores exactly one,
//! the deploy stage of the same run retrieves it, and the run's artifacts are
//! purged once it completes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, RunId};

/// Key for storing/retrieving an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Pipeline run ID.
    pub run_id: RunId,
    /// Stage that produced the artifact.
    pub stage: String,
    /// Published artifact name.
    pub name: String,
}

impl ArtifactKey {
    pub fn new(run_id: RunId, stage: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.stage, self.name)
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    /// SHA-256 of the content, hex encoded.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

/// Statistics from purging a run's artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Storing the same key twice is a conflict.
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact, verifying its checksum.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;

    /// Look up an artifact by key.
    async fn find(&self, key: &ArtifactKey) -> Result<Option<ArtifactRef>>;

    /// List artifacts for a pipeline run.
    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>>;

    /// Delete an artifact.
    async fn delete(&self, reference: &ArtifactRef) -> Result<()>;

    /// Delete every artifact belonging to a run.
    async fn purge_run(&self, run_id: &RunId) -> Result<PruneStats>;
}
