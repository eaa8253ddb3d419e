//! Source Fetcher: mirrors `repos/{id}/...` from the object store into a
//! local working directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};

use super::models::DeploymentId;
use super::store::ObjectStore;
use crate::errors::DeployError;

pub struct SourceFetcher {
    store: Arc<dyn ObjectStore>,
    work_dir: PathBuf,
}

impl SourceFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            work_dir: work_dir.into(),
        }
    }

    /// Local directory a deployment's source is materialised in.
    pub fn project_dir(&self, id: &DeploymentId) -> PathBuf {
        self.work_dir.join(id.as_str())
    }

    /// Download every object under the deployment's source prefix, keeping
    /// relative paths. Any leftover directory from an earlier attempt is
    /// replaced, so the result is exactly the stored tree.
    pub async fn fetch(&self, id: &DeploymentId) -> Result<PathBuf, DeployError> {
        self.fetch_inner(id)
            .await
            .map_err(|source| DeployError::SourceFetch {
                id: id.to_string(),
                source,
            })
    }

    async fn fetch_inner(&self, id: &DeploymentId) -> anyhow::Result<PathBuf> {
        let prefix = id.source_prefix();
        let keys = self
            .store
            .list(&prefix)
            .await
            .with_context(|| format!("Failed to list {}", prefix))?;
        if keys.is_empty() {
            return Err(anyhow!("No source objects under {}", prefix));
        }

        let dest = self.project_dir(id);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dest)
                .await
                .with_context(|| format!("Failed to clear stale {}", dest.display()))?;
        }
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        for key in &keys {
            let rel = relative_source_path(key, &prefix)?;
            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            let mut body = self
                .store
                .get(key)
                .await
                .with_context(|| format!("Failed to read {}", key))?;
            let mut file = tokio::fs::File::create(&target)
                .await
                .with_context(|| format!("Failed to create {}", target.display()))?;
            tokio::io::copy(&mut body, &mut file)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }

        tracing::info!(deployment = %id, files = keys.len(), dir = %dest.display(), "source fetched");
        Ok(dest)
    }
}

/// The part of `key` below `prefix`, as a relative path that cannot leave the
/// destination directory.
fn relative_source_path(key: &str, prefix: &str) -> anyhow::Result<PathBuf> {
    let rel = key
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Key {} is outside {}", key, prefix))?;
    let path = Path::new(rel);
    let normal = !rel.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !normal {
        return Err(anyhow!("Unsafe source key {}", key));
    }
    Ok(path.to_path_buf())
}
