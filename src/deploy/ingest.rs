//! Local submission: upload a project directory as a new deployment and
//! queue its first build.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::broker::{JobQueue, StatusMap};
use super::models::{DeploymentId, DeploymentStatus};
use super::store::ObjectStore;

/// Directory names never uploaded as source.
pub const SKIPPED_DIRS: [&str; 2] = [".git", "node_modules"];

/// Fresh ids drawn before giving up on finding an unused one.
const ID_ATTEMPTS: usize = 16;

#[derive(Debug)]
pub struct Submission {
    pub id: DeploymentId,
    pub files: usize,
}

/// Upload `project_dir` to `repos/{id}/`, record `uploaded` and push the id
/// on the build queue.
pub async fn submit(
    project_dir: &Path,
    store: &dyn ObjectStore,
    status: &dyn StatusMap,
    queue: &dyn JobQueue,
) -> Result<Submission> {
    if !project_dir.is_dir() {
        anyhow::bail!("{} is not a directory", project_dir.display());
    }
    let files = source_files(project_dir)?;
    if files.is_empty() {
        anyhow::bail!("{} contains no files to upload", project_dir.display());
    }

    let id = unused_id(status, DeploymentId::generate).await?;
    let prefix = id.source_prefix();
    for (path, rel) in &files {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        store
            .put(&format!("{}{}", prefix, rel), Box::new(file))
            .await
            .with_context(|| format!("Failed to upload {}", path.display()))?;
    }
    tracing::info!(deployment = %id, files = files.len(), "source uploaded");

    status
        .set(&id, DeploymentStatus::Uploaded)
        .await
        .context("Failed to record upload")?;
    queue.push(&id).await.context("Failed to queue build")?;
    tracing::info!(deployment = %id, "build queued");

    Ok(Submission {
        id,
        files: files.len(),
    })
}

/// Draw ids from `generate` until one has no status record yet, so a
/// collision never overwrites another deployment's source.
async fn unused_id(
    status: &dyn StatusMap,
    mut generate: impl FnMut() -> DeploymentId,
) -> Result<DeploymentId> {
    for _ in 0..ID_ATTEMPTS {
        let id = generate();
        if status
            .get(&id)
            .await
            .context("Failed to check deployment id")?
            .is_none()
        {
            return Ok(id);
        }
        tracing::debug!(deployment = %id, "generated id already in use");
    }
    anyhow::bail!("No unused deployment id after {} attempts", ID_ATTEMPTS)
}

/// Queue an existing deployment again. Its source must still be stored.
pub async fn enqueue(id: &DeploymentId, store: &dyn ObjectStore, queue: &dyn JobQueue) -> Result<()> {
    let sources = store
        .list(&id.source_prefix())
        .await
        .context("Failed to list stored source")?;
    if sources.is_empty() {
        anyhow::bail!("No stored source for deployment {}", id);
    }
    queue.push(id).await.context("Failed to queue build")?;
    tracing::info!(deployment = %id, "rebuild queued");
    Ok(())
}

fn source_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let skipped = e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name));
            e.depth() == 0 || !skipped
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} escaped {}", entry.path().display(), dir.display()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}
