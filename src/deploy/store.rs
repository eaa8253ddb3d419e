//! Object store abstraction and backends.
//!
//! Keys are `/`-separated paths such as `repos/abc12/src/main.ts`. Bodies move
//! as `AsyncRead` streams so neither side has to hold a whole object in memory.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::s3::S3ObjectStore;
use crate::config::{StoreBackend, StoreSection};
use crate::errors::StoreError;

/// Streamed object contents.
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

const TMP_SUFFIX: &str = ".shipyard-tmp";

/// Addressable blob storage keyed by hierarchical string paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open an object for reading. Missing objects are `StoreError::NotFound`.
    async fn get(&self, key: &str) -> Result<ObjectBody, StoreError>;

    /// Write an object, replacing any previous version. Returns bytes written.
    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, StoreError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Open the backend selected by `store.backend`.
pub fn open_store(section: &StoreSection) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match section.backend {
        StoreBackend::Fs => {
            std::fs::create_dir_all(&section.root).with_context(|| {
                format!(
                    "Failed to create object store root {}",
                    section.root.display()
                )
            })?;
            Ok(Arc::new(FsObjectStore::new(&section.root)))
        }
        StoreBackend::S3 => Ok(Arc::new(S3ObjectStore::connect(section)?)),
    }
}

/// Reject keys that could escape a backend's namespace or alias another key.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') {
        return Err(invalid("leading '/'"));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(invalid("forbidden character"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            s if s.ends_with(TMP_SUFFIX) => return Err(invalid("reserved suffix")),
            _ => {}
        }
    }
    Ok(())
}

/// Object store backed by a directory tree on local disk.
///
/// Writes land in a sibling temp file and are renamed into place, so a reader
/// sees either the previous object or the complete new one.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, s| p.join(s)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<ObjectBody, StoreError> {
        let path = self.path_for(key)?;
        let not_found = || StoreError::NotFound {
            key: key.to_string(),
        };
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(StoreError::io(key, e)),
        };
        let meta = file.metadata().await.map_err(|e| StoreError::io(key, e))?;
        if !meta.is_file() {
            return Err(not_found());
        }
        Ok(Box::new(file))
    }

    async fn put(&self, key: &str, mut body: ObjectBody) -> Result<u64, StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = path.with_file_name(format!(
            ".{}.{:08x}{}",
            file_name,
            rand::random::<u32>(),
            TMP_SUFFIX
        ));

        let written = async {
            let mut out = tokio::fs::File::create(&tmp).await?;
            let n = tokio::io::copy(&mut body, &mut out).await?;
            out.flush().await?;
            out.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<_, std::io::Error>(n)
        }
        .await;

        match written {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(StoreError::io(key, e))
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let base = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = base
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(root.clone(), |p, s| p.join(s));
        let prefix_owned = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            if !start.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&start).follow_links(false) {
                let entry = entry.map_err(|e| {
                    StoreError::io(
                        prefix_owned.clone(),
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
                    )
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix_owned) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::io(prefix, std::io::Error::other(e)))?
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(key, e)),
        }
        // prune directories left empty, never the root itself
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }
}

/// In-memory object store with optional failure injection, for tests and
/// dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_prefixes: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get`/`put` on a key under `prefix` fail with an I/O error.
    pub fn fail_prefix(&self, prefix: &str) {
        self.failing_prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data.into());
    }

    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn check_failure(&self, key: &str) -> Result<(), StoreError> {
        let failing = self.failing_prefixes.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StoreError::io(key, std::io::Error::other("injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<ObjectBody, StoreError> {
        validate_key(key)?;
        self.check_failure(key)?;
        let data = self.bytes(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn put(&self, key: &str, mut body: ObjectBody) -> Result<u64, StoreError> {
        validate_key(key)?;
        self.check_failure(key)?;
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        let len = data.len() as u64;
        self.insert(key, data);
        Ok(len)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.check_failure(key)?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Read an object fully into memory. Only for small objects and tests.
pub async fn read_to_vec(store: &dyn ObjectStore, key: &str) -> Result<Vec<u8>, StoreError> {
    let mut body = store.get(key).await?;
    let mut data = Vec::new();
    body.read_to_end(&mut data)
        .await
        .map_err(|e| StoreError::io(key, e))?;
    Ok(data)
}

/// Wrap an in-memory buffer as an `ObjectBody`.
pub fn body_from_bytes(data: impl Into<Vec<u8>>) -> ObjectBody {
    Box::new(std::io::Cursor::new(data.into()))
}
