//! Object Storage
//!
//! The bucket the proxy serves. A [`Bucket`] resolves object names to
//! [`ObjectHandle`]s, which open read streams, write streams and metadata
//! lookups against an [`ObjectStorage`] backend.

mod backend;
mod writer;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::StorageConfig;
use crate::error::Result;

pub use backend::ObjectStoreBackend;
pub use writer::WriteStream;

/// Readable object body; dropping it releases the underlying stream
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Backend-reported object properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttrs {
    /// Object size in bytes
    pub size: u64,
    /// Last modification time, if the backend reports one
    pub last_modified: Option<DateTime<Utc>>,
    /// Entity tag, if the backend reports one
    pub e_tag: Option<String>,
}

/// Write side of a single object.
///
/// Bytes written are not visible to readers until `shutdown` succeeds.
/// `abort` discards whatever was written so far.
#[async_trait]
pub trait ObjectWriter: AsyncWrite + Send + Unpin {
    /// Discard the upload
    async fn abort(&mut self) -> Result<()>;
}

/// Key/value blob store the proxy talks to
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open a read stream; `Error::ObjectNotFound` if the object is absent
    async fn open_read(&self, name: &str) -> Result<ReadStream>;

    /// Open a write stream, creating the object or overwriting it
    async fn open_write(&self, name: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Fetch object metadata; `None` if the object is absent
    async fn fetch_metadata(&self, name: &str) -> Result<Option<ObjectAttrs>>;
}

/// Handle to the bucket the proxy serves
#[derive(Clone)]
pub struct Bucket {
    name: String,
    storage: Arc<dyn ObjectStorage>,
}

impl Bucket {
    /// Wrap a storage backend
    pub fn new(name: impl Into<String>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    /// Open the bucket described by the storage configuration
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let backend = ObjectStoreBackend::from_config(config)?;
        Ok(Self::new(config.bucket.clone(), Arc::new(backend)))
    }

    /// Empty in-memory bucket
    pub fn in_memory() -> Self {
        Self::new("memory://", Arc::new(ObjectStoreBackend::in_memory()))
    }

    /// Bucket name as configured
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve an object by name. Never fails; absence shows up on use.
    pub fn object(&self, name: impl Into<String>) -> ObjectHandle<'_> {
        ObjectHandle {
            storage: self.storage.as_ref(),
            name: name.into(),
        }
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

/// A named object inside a [`Bucket`]
pub struct ObjectHandle<'a> {
    storage: &'a dyn ObjectStorage,
    name: String,
}

impl ObjectHandle<'_> {
    /// Full object name inside the bucket
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the object body for reading
    pub async fn new_reader(&self) -> Result<ReadStream> {
        self.storage.open_read(&self.name).await
    }

    /// Open a guarded write stream for the object
    pub async fn new_writer(&self) -> Result<WriteStream> {
        let writer = self.storage.open_write(&self.name).await?;
        Ok(WriteStream::new(self.name.clone(), writer))
    }

    /// Object metadata, `None` if the object does not exist
    pub async fn attrs(&self) -> Result<Option<ObjectAttrs>> {
        self.storage.fetch_metadata(&self.name).await
    }
}
