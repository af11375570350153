//! Bucket Proxy - Object Storage as a Flat HTTP File Server
//!
//! An HTTP proxy that translates plain REST verbs into operations on an
//! object-storage bucket, so clients can read and write blobs without
//! storage credentials or SDKs of their own.
//!
//! # Request mapping
//!
//! Every request path, minus one leading slash, is appended to a configured
//! key prefix to form the object name:
//!
//! - `GET /<key>` streams the object (`404` if absent)
//! - `HEAD /<key>` checks existence (`200` or `404`)
//! - `PUT` / `POST /<key>` uploads the request body (`201`, or `400` on failure)
//! - any other method answers `405`
//!
//! # Backends
//!
//! Google Cloud Storage, Amazon S3, a local directory or an in-memory store,
//! selected by the bucket URL (`gs://`, `s3://`, `file://`, `memory://`).

pub mod config;
pub mod error;
pub mod proxy;
pub mod storage;

pub use config::ProxyConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BucketLocation, ProxyConfig};
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{ProxyError, StorageProxy};
    pub use crate::storage::{Bucket, ObjectStorage, ObjectWriter, WriteStream};
}
