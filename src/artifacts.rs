//! Content-addressed artifact store.
//!
//! Artifacts produced by branches and workers are written under the
//! workspace, keyed by a stable `sha256:<hex>` id. Conclusions and task
//! descriptions carry only references; the bytes are served on demand.

use crate::error::Result;
use crate::persist::{AggregateKind, Backend};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Index entry for one stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    /// Path relative to the workspace root.
    pub relative_path: String,
    pub size_bytes: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

pub struct ArtifactStore {
    workspace_root: PathBuf,
    backend: Arc<dyn Backend>,
}

impl ArtifactStore {
    pub fn new(workspace_root: PathBuf, backend: Arc<dyn Backend>) -> Self {
        Self {
            workspace_root,
            backend,
        }
    }

    /// Stable content-addressed id for `bytes`.
    pub fn content_id(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("sha256:{:x}", hasher.finalize())
    }

    /// Write `bytes` under `relative_dir` (relative to the workspace root)
    /// with `filename`, and index it. Re-storing identical content is a
    /// no-op that returns the existing record.
    pub async fn store(
        &self,
        relative_dir: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRecord> {
        let id = Self::content_id(bytes);
        if let Some(existing) = self.backend.get_aggregate(AggregateKind::Artifacts, &id).await? {
            if let Ok(record) = serde_json::from_value::<ArtifactRecord>(existing) {
                return Ok(record);
            }
        }

        let relative_path = relative_dir.join(filename);
        let absolute = self.workspace_root.join(&relative_path);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&absolute, bytes)
            .await
            .with_context(|| format!("failed to write artifact {}", absolute.display()))?;

        let record = ArtifactRecord {
            id: id.clone(),
            relative_path: relative_path.to_string_lossy().to_string(),
            size_bytes: bytes.len() as u64,
            version: 1,
            created_at: Utc::now(),
        };
        self.backend
            .put_aggregate(
                AggregateKind::Artifacts,
                &id,
                serde_json::to_value(&record).context("serialize artifact record")?,
            )
            .await?;

        tracing::debug!(artifact_id = %id, path = %record.relative_path, "artifact stored");
        Ok(record)
    }

    /// Look up an artifact's index entry.
    pub async fn get(&self, id: &str) -> Result<Option<ArtifactRecord>> {
        let Some(body) = self.backend.get_aggregate(AggregateKind::Artifacts, id).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(body).ok())
    }

    /// Read an artifact's bytes; `None` when the id is unknown.
    pub async fn content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        let absolute = self.workspace_root.join(&record.relative_path);
        let bytes = tokio::fs::read(&absolute)
            .await
            .with_context(|| format!("failed to read artifact {}", absolute.display()))?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryBackend;

    #[tokio::test]
    async fn store_and_fetch_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().to_path_buf(), MemoryBackend::new());

        let record = store
            .store(Path::new("artifacts"), "notes.md", b"artifact body")
            .await
            .expect("store");
        assert!(record.id.starts_with("sha256:"));
        assert_eq!(record.size_bytes, 13);

        let bytes = store
            .content(&record.id)
            .await
            .expect("content")
            .expect("artifact exists");
        assert_eq!(bytes, b"artifact body");

        assert!(store.content("sha256:unknown").await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn identical_content_is_deduplicated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().to_path_buf(), MemoryBackend::new());

        let first = store
            .store(Path::new("artifacts"), "a.txt", b"same")
            .await
            .expect("store");
        let second = store
            .store(Path::new("elsewhere"), "b.txt", b"same")
            .await
            .expect("store");
        assert_eq!(first.id, second.id);
        assert_eq!(first.relative_path, second.relative_path);
    }
}
