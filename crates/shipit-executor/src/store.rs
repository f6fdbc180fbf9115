//! Filesystem artifact store.
//!
//! Layout: `<root>/<run id>/<stage>/<name>` with a `<name>.ref.json` sidecar
//! holding the [`ArtifactRef`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use shipit_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore, PruneStats};
use shipit_core::{Error, Result, RunId};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const REF_SUFFIX: &str = ".ref.json";

/// Stores artifacts as plain files under a root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn paths(&self, key: &ArtifactKey) -> Result<(PathBuf, PathBuf)> {
        for part in [&key.stage, &key.name] {
            if part.is_empty() || part.contains(['/', '\\']) || part == ".." || part == "." {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a valid artifact path segment",
                    part
                )));
            }
        }
        let dir = self.run_dir(&key.run_id).join(&key.stage);
        let data = dir.join(&key.name);
        let reference = dir.join(format!("{}{}", key.name, REF_SUFFIX));
        Ok((data, reference))
    }

    async fn read_ref(path: &Path) -> Result<ArtifactRef> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Internal(format!("corrupt artifact record {}: {}", path.display(), e)))
    }
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef> {
        let (data_path, ref_path) = self.paths(key)?;
        if tokio::fs::try_exists(&ref_path).await? {
            return Err(Error::Conflict(format!("artifact {} already published", key)));
        }
        if let Some(dir) = data_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut tmp = data_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &data_path).await?;

        let reference = ArtifactRef {
            key: key.clone(),
            location: data_path.display().to_string(),
            checksum: checksum(&data),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        let record = serde_json::to_vec_pretty(&reference)
            .map_err(|e| Error::Internal(e.to_string()))?;
        tokio::fs::write(&ref_path, record).await?;

        info!(artifact = %key, size = reference.size, checksum = %reference.checksum, "Stored artifact");
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let (data_path, _) = self.paths(&reference.key)?;
        let data = match tokio::fs::read(&data_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("artifact {}", reference.key)));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = checksum(&data);
        if actual != reference.checksum {
            return Err(Error::Internal(format!(
                "artifact {} checksum mismatch: expected {}, found {}",
                reference.key, reference.checksum, actual
            )));
        }
        Ok(Bytes::from(data))
    }

    async fn find(&self, key: &ArtifactKey) -> Result<Option<ArtifactRef>> {
        let (_, ref_path) = self.paths(key)?;
        if !tokio::fs::try_exists(&ref_path).await? {
            return Ok(None);
        }
        Self::read_ref(&ref_path).await.map(Some)
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>> {
        let run_dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&run_dir).await? {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        let mut stages = tokio::fs::read_dir(&run_dir).await?;
        while let Some(stage) = stages.next_entry().await? {
            if !stage.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(stage.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(REF_SUFFIX) {
                    refs.push(Self::read_ref(&entry.path()).await?);
                }
            }
        }
        refs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(refs)
    }

    async fn delete(&self, reference: &ArtifactRef) -> Result<()> {
        let (data_path, ref_path) = self.paths(&reference.key)?;
        for path in [data_path, ref_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(artifact = %reference.key, "Deleted artifact");
        Ok(())
    }

    async fn purge_run(&self, run_id: &RunId) -> Result<PruneStats> {
        let refs = self.list(run_id).await?;
        let stats = PruneStats {
            artifacts_deleted: refs.len() as u64,
            bytes_freed: refs.iter().map(|r| r.size).sum(),
        };
        let run_dir = self.run_dir(run_id);
        if tokio::fs::try_exists(&run_dir).await? {
            tokio::fs::remove_dir_all(&run_dir).await?;
        }
        info!(run_id = %run_id, artifacts = stats.artifacts_deleted, bytes = stats.bytes_freed, "Purged run artifacts");
        Ok(stats)
    }
}
