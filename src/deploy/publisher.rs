//! Artifact Publisher: finds the build output directory and uploads every file
//! in it under `builds/{id}/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};

use super::models::DeploymentId;
use super::store::ObjectStore;
use crate::errors::{DeployError, StoreError};

/// Output directories a build may produce, tried in this order.
pub const OUTPUT_DIR_CANDIDATES: [&str; 3] = ["dist", "build", "out"];

/// Return the first candidate output directory that exists under `project_dir`.
/// A candidate that is a symlink is never used, whatever it points at.
pub fn discover_output_dir(project_dir: &Path) -> Result<PathBuf, DeployError> {
    for candidate in OUTPUT_DIR_CANDIDATES {
        let dir = project_dir.join(candidate);
        match std::fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() => {
                tracing::warn!(dir = %dir.display(), "ignoring symlinked output directory");
            }
            Ok(meta) if meta.is_dir() => return Ok(dir),
            _ => {}
        }
    }

    let mut contents: Vec<String> = std::fs::read_dir(project_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    contents.sort();

    Err(DeployError::NoOutputDirectoryFound {
        project_dir: project_dir.to_path_buf(),
        candidates: OUTPUT_DIR_CANDIDATES.iter().map(|c| c.to_string()).collect(),
        contents,
    })
}

pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload the output directory of `project_dir`, then delete any object
    /// under `builds/{id}/` the new output does not contain. Returns the
    /// published keys, sorted. The first failing upload aborts the publish
    /// before anything is deleted.
    pub async fn publish(
        &self,
        id: &DeploymentId,
        project_dir: &Path,
    ) -> Result<Vec<String>, DeployError> {
        let output_dir = discover_output_dir(project_dir)?;
        let files = collect_files(&output_dir)?;
        let prefix = id.artifact_prefix();

        tracing::info!(
            deployment = %id,
            output = %output_dir.display(),
            files = files.len(),
            "publishing build output"
        );

        let mut keys: Vec<String> = stream::iter(files)
            .map(|(path, rel)| {
                let key = format!("{}{}", prefix, rel);
                let store = self.store.clone();
                async move {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|e| DeployError::PublishUpload {
                            file: path.clone(),
                            source: StoreError::io(key.clone(), e),
                        })?;
                    store
                        .put(&key, Box::new(file))
                        .await
                        .map_err(|source| DeployError::PublishUpload {
                            file: path.clone(),
                            source,
                        })?;
                    Ok::<_, DeployError>(key)
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        keys.sort();
        self.prune_stale(id, &prefix, &keys).await?;
        tracing::info!(deployment = %id, objects = keys.len(), "build output published");
        Ok(keys)
    }

    /// Remove objects left over from an earlier build. `published` is sorted.
    async fn prune_stale(
        &self,
        id: &DeploymentId,
        prefix: &str,
        published: &[String],
    ) -> Result<(), DeployError> {
        let existing = self
            .store
            .list(prefix)
            .await
            .map_err(|e| {
                DeployError::Other(
                    anyhow::Error::new(e).context("Failed to list published artifacts"),
                )
            })?;
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|key| published.binary_search(key).is_err())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        tracing::info!(
            deployment = %id,
            stale = stale.len(),
            "removing artifacts from previous build"
        );
        stream::iter(stale)
            .map(|key| {
                let store = self.store.clone();
                async move {
                    store.delete(&key).await.map_err(|e| {
                        DeployError::Other(
                            anyhow::Error::new(e)
                                .context(format!("Failed to delete stale artifact {}", key)),
                        )
                    })
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }
}

/// Regular files below `dir` with their `/`-separated relative paths.
/// Symlinks are neither followed nor published, including `dir` itself.
fn collect_files(dir: &Path) -> Result<Vec<(PathBuf, String)>, DeployError> {
    let meta = std::fs::symlink_metadata(dir).map_err(|e| {
        DeployError::Other(
            anyhow::Error::new(e).context(format!("Failed to stat {}", dir.display())),
        )
    })?;
    if !meta.is_dir() {
        return Err(DeployError::Other(anyhow::anyhow!(
            "Build output {} is not a real directory",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .follow_root_links(false);
    for entry in walker {
        let entry = entry.map_err(|e| {
            DeployError::Other(anyhow::Error::new(e).context(format!(
                "Failed to walk build output {}",
                dir.display()
            )))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::store::{FsObjectStore, MemoryObjectStore, body_from_bytes, read_to_vec};

    fn id() -> DeploymentId {
        DeploymentId::parse("pub01").unwrap()
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_dist_wins_over_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        assert_eq!(discover_output_dir(dir.path()).unwrap(), dir.path().join("dist"));
    }

    #[test]
    fn test_out_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        assert_eq!(discover_output_dir(dir.path()).unwrap(), dir.path().join("out"));
    }

    #[test]
    fn test_candidate_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dist"), "not a dir").unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        assert_eq!(discover_output_dir(dir.path()).unwrap(), dir.path().join("build"));
    }

    #[test]
    fn test_no_output_dir_reports_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();

        match discover_output_dir(dir.path()).unwrap_err() {
            DeployError::NoOutputDirectoryFound {
                candidates,
                contents,
                ..
            } => {
                assert_eq!(candidates, vec!["dist", "build", "out"]);
                assert_eq!(contents, vec!["package.json", "src"]);
            }
            other => panic!("Expected NoOutputDirectoryFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_uploads_every_file_with_relative_keys() {
        let project = tempfile::tempdir().unwrap();
        write(&project.path().join("dist/index.html"), "<h1>hi</h1>");
        write(&project.path().join("dist/assets/app.js"), "run()");
        write(&project.path().join("dist/assets/css/site.css"), "body{}");
        write(&project.path().join("src/ignored.js"), "nope");

        let store = Arc::new(MemoryObjectStore::new());
        let keys = ArtifactPublisher::new(store.clone(), 2)
            .publish(&id(), project.path())
            .await
            .unwrap();

        assert_eq!(
            keys,
            vec![
                "builds/pub01/assets/app.js",
                "builds/pub01/assets/css/site.css",
                "builds/pub01/index.html",
            ]
        );
        assert_eq!(store.keys(), keys);
        assert_eq!(
            store.bytes("builds/pub01/index.html").unwrap(),
            b"<h1>hi</h1>"
        );
    }

    #[tokio::test]
    async fn test_republish_is_idempotent() {
        let project = tempfile::tempdir().unwrap();
        write(&project.path().join("build/index.html"), "v1");
        write(&project.path().join("build/a/b.txt"), "b");

        let objects = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(objects.path()));
        let publisher = ArtifactPublisher::new(store.clone(), 8);

        let first = publisher.publish(&id(), project.path()).await.unwrap();
        let second = publisher.publish(&id(), project.path()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list("builds/pub01/").await.unwrap(), first);
        assert_eq!(
            read_to_vec(store.as_ref(), "builds/pub01/index.html")
                .await
                .unwrap(),
            b"v1"
        );
    }

    #[tokio::test]
    async fn test_upload_failure_names_the_file() {
        let project = tempfile::tempdir().unwrap();
        write(&project.path().join("dist/index.html"), "x");

        let store = Arc::new(MemoryObjectStore::new());
        store.fail_prefix("builds/pub01/");
        let err = ArtifactPublisher::new(store, 8)
            .publish(&id(), project.path())
            .await
            .unwrap_err();
        match err {
            DeployError::PublishUpload { file, .. } => {
                assert_eq!(file, project.path().join("dist/index.html"));
            }
            other => panic!("Expected PublishUpload, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_published() {
        let project = tempfile::tempdir().unwrap();
        write(&project.path().join("dist/index.html"), "x");
        write(&project.path().join("secret.txt"), "s");
        std::os::unix::fs::symlink(
            project.path().join("secret.txt"),
            project.path().join("dist/leak.txt"),
        )
        .unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let keys = ArtifactPublisher::new(store, 8)
            .publish(&id(), project.path())
            .await
            .unwrap();
        assert_eq!(keys, vec!["builds/pub01/index.html"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_output_dir_is_never_published() {
        let outside = tempfile::tempdir().unwrap();
        write(&outside.path().join("id_rsa"), "HOST SECRET");
        let project = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), project.path().join("dist")).unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let err = ArtifactPublisher::new(store.clone(), 8)
            .publish(&id(), project.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NoOutputDirectoryFound { .. }));
        assert!(store.keys().is_empty());

        // a real `build` directory behind the symlinked `dist` still wins
        write(&project.path().join("build/index.html"), "ok");
        let keys = ArtifactPublisher::new(store.clone(), 8)
            .publish(&id(), project.path())
            .await
            .unwrap();
        assert_eq!(keys, vec!["builds/pub01/index.html"]);
        assert_eq!(store.keys(), keys);
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_files_refuses_symlinked_root() {
        let outside = tempfile::tempdir().unwrap();
        write(&outside.path().join("id_rsa"), "HOST SECRET");
        let project = tempfile::tempdir().unwrap();
        let link = project.path().join("out");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        assert!(collect_files(&link).is_err());
    }

    #[tokio::test]
    async fn test_rebuild_removes_files_the_new_output_lacks() {
        let store = Arc::new(MemoryObjectStore::new());
        let publisher = ArtifactPublisher::new(store.clone(), 4);

        let v1 = tempfile::tempdir().unwrap();
        write(&v1.path().join("dist/index.html"), "v1");
        write(&v1.path().join("dist/old.js"), "old()");
        publisher.publish(&id(), v1.path()).await.unwrap();

        let v2 = tempfile::tempdir().unwrap();
        write(&v2.path().join("dist/index.html"), "v2");
        let keys = publisher.publish(&id(), v2.path()).await.unwrap();

        assert_eq!(keys, vec!["builds/pub01/index.html"]);
        assert_eq!(store.keys(), vec!["builds/pub01/index.html"]);
        assert_eq!(store.bytes("builds/pub01/index.html").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_rebuild_leaves_other_deployments_alone() {
        let objects = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(objects.path()));
        for key in ["builds/pub011/keep.html", "builds/other/index.html"] {
            store.put(key, body_from_bytes("keep")).await.unwrap();
        }

        let project = tempfile::tempdir().unwrap();
        write(&project.path().join("out/index.html"), "mine");
        ArtifactPublisher::new(store.clone(), 2)
            .publish(&id(), project.path())
            .await
            .unwrap();

        assert_eq!(
            store.list("builds/").await.unwrap(),
            vec![
                "builds/other/index.html",
                "builds/pub01/index.html",
                "builds/pub011/keep.html",
            ]
        );
    }
}
