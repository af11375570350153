//! `object_store` backed storage
//!
//! One adapter covers every supported bucket location: Google Cloud Storage,
//! Amazon S3, a local directory or an in-memory store.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use tokio_util::io::StreamReader;

use super::{ObjectAttrs, ObjectStorage, ObjectWriter, ReadStream};
use crate::config::{BucketLocation, StorageConfig};
use crate::error::{Error, Result};

/// Storage backend over any [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Empty in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build the store the configured bucket URL points at
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match BucketLocation::parse(&config.bucket)? {
            BucketLocation::Gcs(bucket) => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&bucket);
                if let Some(path) = &config.credentials_path {
                    builder = builder.with_service_account_path(path.to_string_lossy());
                }
                Arc::new(builder.build()?)
            }
            BucketLocation::S3(bucket) => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
            BucketLocation::Local(root) => {
                std::fs::create_dir_all(&root)?;
                Arc::new(LocalFileSystem::new_with_prefix(&root)?)
            }
            BucketLocation::Memory => Arc::new(InMemory::new()),
        };

        tracing::debug!("Opened bucket {} ({})", config.bucket, store);
        Ok(Self::new(store))
    }

    /// Store path for an object name, stored verbatim.
    ///
    /// Names the store cannot hold unchanged (empty, leading or trailing
    /// `/`, empty segments, `.` or `..` segments, control characters) are
    /// rejected instead of being rewritten into some other object's name.
    fn object_path(name: &str) -> Result<Path> {
        let invalid = |reason: String| Error::InvalidObjectName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("empty name".to_string()));
        }
        let path = Path::parse(name).map_err(|e| invalid(e.to_string()))?;
        if path.as_ref() != name {
            return Err(invalid("leading or trailing '/'".to_string()));
        }
        Ok(path)
    }

    fn map_error(name: &str, err: object_store::Error) -> Error {
        match err {
            object_store::Error::NotFound { .. } => Error::ObjectNotFound(name.to_string()),
            other => Error::Storage(other),
        }
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreBackend {
    async fn open_read(&self, name: &str) -> Result<ReadStream> {
        let result = self
            .store
            .get(&Self::object_path(name)?)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        let body: BoxStream<'static, io::Result<Bytes>> =
            Box::pin(result.into_stream().map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(body)))
    }

    async fn open_write(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        let path = Self::object_path(name)?;
        Ok(Box::new(BufWriter::new(Arc::clone(&self.store), path)))
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Option<ObjectAttrs>> {
        match self.store.head(&Self::object_path(name)?).await {
            Ok(meta) => Ok(Some(ObjectAttrs {
                size: meta.size as u64,
                last_modified: Some(meta.last_modified),
                e_tag: meta.e_tag,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::Storage(e)),
        }
    }
}

#[async_trait]
impl ObjectWriter for BufWriter {
    async fn abort(&mut self) -> Result<()> {
        BufWriter::abort(self).await?;
        Ok(())
    }
}
