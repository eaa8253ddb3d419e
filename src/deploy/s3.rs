//! S3-compatible object store backend (AWS S3, Cloudflare R2, MinIO).
//!
//! Keys map one to one onto bucket object names. Uploads stream through a
//! buffered multipart writer, downloads stream straight from the response.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::ObjectStore as _;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use super::store::{ObjectBody, ObjectStore, validate_key};
use crate::config::StoreSection;
use crate::errors::StoreError;

pub struct S3ObjectStore {
    bucket: String,
    client: Arc<dyn object_store::ObjectStore>,
}

impl S3ObjectStore {
    /// Build a client from the `[store]` section. Standard `AWS_*`
    /// variables fill in anything the section leaves unset. No request is
    /// made until the first operation.
    pub fn connect(section: &StoreSection) -> anyhow::Result<Self> {
        let bucket = section
            .bucket
            .clone()
            .filter(|b| !b.trim().is_empty())
            .context("store.bucket is required for the s3 backend")?;

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&bucket)
            .with_region(&section.region)
            .with_allow_http(section.allow_http);
        if let Some(endpoint) = &section.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let (Some(key), Some(secret)) = (&section.access_key_id, &section.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        let client = builder
            .build()
            .with_context(|| format!("Failed to configure S3 client for bucket {}", bucket))?;

        tracing::info!(
            bucket = %bucket,
            endpoint = section.endpoint.as_deref().unwrap_or("aws"),
            "using S3 object store"
        );
        Ok(Self {
            bucket,
            client: Arc::new(client),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn object_path(key: &str) -> Result<ObjectPath, StoreError> {
    validate_key(key)?;
    ObjectPath::parse(key).map_err(|e| StoreError::InvalidKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn backend_error(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound {
            key: key.to_string(),
        },
        other => StoreError::io(key, std::io::Error::other(other)),
    }
}

/// Directory part of a listing prefix: `repos/abc1` lists under `repos`.
fn listing_base(prefix: &str) -> Option<ObjectPath> {
    match prefix.rfind('/') {
        Some(i) if i > 0 => Some(ObjectPath::from(&prefix[..i])),
        _ => None,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<ObjectBody, StoreError> {
        let path = object_path(key)?;
        let result = self
            .client
            .get(&path)
            .await
            .map_err(|e| backend_error(key, e))?;
        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn put(&self, key: &str, mut body: ObjectBody) -> Result<u64, StoreError> {
        let path = object_path(key)?;
        let mut writer = BufWriter::new(self.client.clone(), path);
        let copied = tokio::io::copy(&mut body, &mut writer).await;
        let written = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(StoreError::io(key, e));
            }
        };
        writer
            .shutdown()
            .await
            .map_err(|e| StoreError::io(key, e))?;
        Ok(written)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = listing_base(prefix);
        let mut keys: Vec<String> = self
            .client
            .list(base.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_filter(|key| futures::future::ready(key.starts_with(prefix)))
            .try_collect()
            .await
            .map_err(|e| backend_error(prefix, e))?;
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = object_path(key)?;
        match self.client.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(backend_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::deploy::store::{body_from_bytes, read_to_vec};

    fn section() -> StoreSection {
        StoreSection {
            backend: StoreBackend::S3,
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            bucket: Some("deployments".to_string()),
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio123".to_string()),
            allow_http: true,
            ..StoreSection::default()
        }
    }

    #[test]
    fn test_connect_builds_client_without_network() {
        let store = S3ObjectStore::connect(&section()).unwrap();
        assert_eq!(store.bucket(), "deployments");
    }

    #[test]
    fn test_connect_requires_bucket() {
        let mut section = section();
        section.bucket = Some("  ".to_string());
        let err = S3ObjectStore::connect(&section).err().unwrap();
        assert!(err.to_string().contains("store.bucket"));
    }

    #[test]
    fn test_object_path_rejects_escapes() {
        assert_eq!(
            object_path("builds/abc12/index.html").unwrap().as_ref(),
            "builds/abc12/index.html"
        );
        assert!(matches!(
            object_path("builds/../secret"),
            Err(StoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_listing_base_is_directory_of_prefix() {
        assert_eq!(listing_base("repos/abc1").unwrap().as_ref(), "repos");
        assert_eq!(
            listing_base("builds/abc12/").unwrap().as_ref(),
            "builds/abc12"
        );
        assert!(listing_base("repos").is_none());
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_any_request() {
        let store = S3ObjectStore::connect(&section()).unwrap();
        assert!(matches!(
            store.put("/etc/passwd", body_from_bytes("x")).await,
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.delete("a//b").await,
            Err(StoreError::InvalidKey { .. })
        ));
    }

    /// Needs a reachable bucket: set SHIPYARD_TEST_S3_ENDPOINT,
    /// SHIPYARD_TEST_S3_BUCKET, SHIPYARD_TEST_S3_ACCESS_KEY_ID and
    /// SHIPYARD_TEST_S3_SECRET_ACCESS_KEY.
    #[tokio::test]
    #[ignore]
    async fn test_live_bucket_put_get_list_delete() {
        let var = |name: &str| std::env::var(name).ok();
        let section = StoreSection {
            backend: StoreBackend::S3,
            endpoint: var("SHIPYARD_TEST_S3_ENDPOINT"),
            bucket: var("SHIPYARD_TEST_S3_BUCKET"),
            access_key_id: var("SHIPYARD_TEST_S3_ACCESS_KEY_ID"),
            secret_access_key: var("SHIPYARD_TEST_S3_SECRET_ACCESS_KEY"),
            allow_http: true,
            ..StoreSection::default()
        };
        let store = S3ObjectStore::connect(&section).unwrap();
        let key = "builds/s3tst/index.html";

        store.put(key, body_from_bytes("<h1>s3</h1>")).await.unwrap();
        assert_eq!(read_to_vec(&store, key).await.unwrap(), b"<h1>s3</h1>");
        assert_eq!(store.list("builds/s3t").await.unwrap(), vec![key]);

        store.delete(key).await.unwrap();
        assert!(matches!(
            store.get(key).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
