//! Object storage for overflow batches
//! Uses Apache Arrow object_store crate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, path::Path as StoragePath};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{OverflowConfig, StorageProvider};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata returned after upload
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub key: String,
    pub etag: Option<String>,
    pub size: usize,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Minimal blob operations the overflow producer and replay consumer need
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<UploadMetadata>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Objects directly under `prefix` (empty prefix = root)
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Storage client wrapping object_store
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl StorageClient {
    /// Create new storage client with any object_store backend
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "doubleteam-local".to_string(),
        }
    }

    /// Build the backend selected in the overflow configuration
    pub fn from_config(config: &OverflowConfig) -> Result<Self> {
        match config.provider {
            StorageProvider::Memory => Ok(Self {
                bucket: config.bucket.clone(),
                ..Self::in_memory()
            }),
            StorageProvider::Local => {
                std::fs::create_dir_all(&config.root)?;
                let store = LocalFileSystem::new_with_prefix(&config.root)?;
                tracing::info!(root = %config.root.display(), "Using local overflow storage");
                Ok(Self::new(Arc::new(store), config.bucket.clone()))
            }
            StorageProvider::S3 => {
                let region = config
                    .region
                    .as_deref()
                    .ok_or_else(|| StorageError::InvalidConfig("S3 region is required".into()))?;

                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&config.bucket)
                    .with_region(region);

                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(!endpoint.starts_with("https"));
                }
                if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
                    builder = builder
                        .with_access_key_id(access_key)
                        .with_secret_access_key(secret_key);
                }

                tracing::info!(bucket = %config.bucket, region, "Using S3 overflow storage");
                Ok(Self::new(Arc::new(builder.build()?), config.bucket.clone()))
            }
        }
    }

    /// Check if key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);

        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for StorageClient {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<UploadMetadata> {
        let path = StoragePath::from(key);
        let size = data.len();

        let put_result = self.store.put(&path, data.into()).await?;

        tracing::debug!(key, size, "Uploaded to storage");

        Ok(UploadMetadata {
            key: key.to_string(),
            etag: put_result.e_tag,
            size,
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = StoragePath::from(key);

        let bytes = self.store.get(&path).await?.bytes().await?;

        tracing::debug!(key, size = bytes.len(), "Downloaded from storage");

        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let prefix = (!prefix.is_empty()).then(|| StoragePath::from(prefix));

        let listing = self.store.list_with_delimiter(prefix.as_ref()).await?;

        Ok(listing
            .objects
            .into_iter()
            .map(|meta| ObjectInfo {
                key: meta.location.to_string(),
                last_modified: meta.last_modified,
                size: meta.size as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&StoragePath::from(key)).await?;
        tracing::debug!(key, "Deleted from storage");
        Ok(())
    }
}
