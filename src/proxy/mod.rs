//! HTTP Storage Proxy
//!
//! Serves a bucket as a flat HTTP file server. Every request path is mapped
//! to an object key under a fixed prefix:
//! - `GET`  downloads the object
//! - `HEAD` checks that the object exists
//! - `POST` / `PUT` upload (create or overwrite) the object

mod handler;
mod server;

pub use handler::{request_key, ProxyError};
pub use server::{bind_listener, StorageProxy};
