//! Bucket Proxy - Object Storage as a Flat HTTP File Server
//!
//! Serves a GCS / S3 / local bucket over plain HTTP GET, HEAD, PUT and POST.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bucket_proxy::config::{LoggingConfig, ProxyConfig};
use bucket_proxy::error::Result;
use bucket_proxy::proxy::StorageProxy;

/// Bucket Proxy - serve an object-storage bucket as a flat HTTP file server
#[derive(Parser)]
#[command(name = "bucket-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bucket URL (gs://name, s3://name, file:///dir, memory://) or GCS bucket name
    #[arg(short, long)]
    bucket: Option<String>,

    /// Prefix prepended to every object key
    #[arg(short, long)]
    prefix: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Load the configuration file (if any) and apply command line overrides
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::read_file(path)?,
            None => ProxyConfig::for_bucket(""),
        };

        if let Some(bucket) = self.bucket {
            config.storage.bucket = bucket;
        }
        if let Some(prefix) = self.prefix {
            config.storage.prefix = prefix;
        }
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e);
        }
    };

    // Initialize logging
    init_logging(&config.logging);

    let proxy = match StorageProxy::from_config(&config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to open bucket {}: {}", config.storage.bucket, e);
            return Err(e);
        }
    };

    if let Err(e) = proxy
        .serve_with_shutdown(&config.server.address, config.server.port, shutdown_signal())
        .await
    {
        tracing::error!("Http cache server failed: {}", e);
        return Err(e);
    }

    tracing::info!("Bucket proxy shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Received shutdown signal");
}
