//! Storage proxy server
//!
//! Owns the bucket handle and key prefix, builds its own router and serves
//! it on a TCP listener. Instances share nothing, so several can run in one
//! process.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::handler::{handle_request, ProxyState};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::storage::Bucket;

/// Bind the proxy's TCP listener
pub async fn bind_listener(address: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{}:{}", address, port);
    TcpListener::bind(&address)
        .await
        .map_err(|source| Error::Bind { address, source })
}

/// HTTP proxy in front of one bucket
#[derive(Clone)]
pub struct StorageProxy {
    state: Arc<ProxyState>,
}

impl StorageProxy {
    /// Create a proxy serving `bucket` under `prefix`
    pub fn new(bucket: Bucket, prefix: impl Into<String>) -> Self {
        let state = Arc::new(ProxyState {
            bucket,
            prefix: prefix.into(),
        });

        Self { state }
    }

    /// Open the configured bucket and create a proxy for it
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let bucket = Bucket::open(&config.storage)?;
        Ok(Self::new(bucket, config.storage.prefix.clone()))
    }

    /// Bucket being served
    pub fn bucket(&self) -> &Bucket {
        &self.state.bucket
    }

    /// Key prefix
    pub fn prefix(&self) -> &str {
        &self.state.prefix
    }

    /// Storage object name a request key maps to
    pub fn object_name(&self, key: &str) -> String {
        self.state.object_name(key)
    }

    /// Create the router: every path and method goes to one handler
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind `address:port` and serve until the server fails
    pub async fn serve(self, address: &str, port: u16) -> Result<()> {
        self.serve_with_shutdown(address, port, std::future::pending())
            .await
    }

    /// Bind `address:port` and serve until `signal` resolves
    pub async fn serve_with_shutdown<F>(self, address: &str, port: u16, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = bind_listener(address, port).await?;
        self.run(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// In-flight requests are allowed to finish after the signal.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Starting http cache server {} (bucket {}, prefix {:?})",
            local_addr,
            self.state.bucket.name(),
            self.state.prefix
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("Http cache server {} stopped", local_addr);
        Ok(())
    }
}

impl std::fmt::Debug for StorageProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProxy")
            .field("bucket", &self.state.bucket)
            .field("prefix", &self.state.prefix)
            .finish()
    }
}
