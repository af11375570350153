//! Bucket Proxy Configuration
//!
//! This module provides configuration structures for the bucket proxy:
//! which bucket to serve, the key prefix, where to listen and how to log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Backing bucket configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backing bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Bucket URL: `gs://name`, `s3://name`, `file:///dir`, `memory://`
    /// or a bare bucket name (Google Cloud Storage)
    #[serde(default)]
    pub bucket: String,

    /// Prefix prepended to every request path to form the object key
    #[serde(default)]
    pub prefix: String,

    /// Service account key file (gs:// only, environment credentials otherwise)
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Region (s3:// only)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores (s3:// only)
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_address")]
    pub address: String,

    /// Port to bind (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Where a bucket URL points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketLocation {
    /// Google Cloud Storage bucket
    Gcs(String),
    /// Amazon S3 (or compatible) bucket
    S3(String),
    /// Directory on the local filesystem
    Local(PathBuf),
    /// Process-local in-memory store
    Memory,
}

impl BucketLocation {
    /// Parse a bucket URL
    pub fn parse(bucket: &str) -> crate::Result<Self> {
        let Some((scheme, rest)) = bucket.split_once("://") else {
            if bucket.is_empty() || bucket.contains('/') {
                return Err(crate::Error::Config(format!("invalid bucket name: {:?}", bucket)));
            }
            return Ok(BucketLocation::Gcs(bucket.to_string()));
        };

        let location = match scheme {
            "gs" | "gcs" => BucketLocation::Gcs(rest.trim_end_matches('/').to_string()),
            "s3" => BucketLocation::S3(rest.trim_end_matches('/').to_string()),
            "file" => BucketLocation::Local(PathBuf::from(rest)),
            "memory" => return Ok(BucketLocation::Memory),
            other => {
                return Err(crate::Error::Config(format!(
                    "unsupported bucket scheme {:?} in {:?}",
                    other, bucket
                )))
            }
        };

        match &location {
            BucketLocation::Gcs(name) | BucketLocation::S3(name) if name.is_empty() => {
                Err(crate::Error::Config(format!("missing bucket name in {:?}", bucket)))
            }
            BucketLocation::Local(path) if path.as_os_str().is_empty() => {
                Err(crate::Error::Config(format!("missing directory in {:?}", bucket)))
            }
            _ => Ok(location),
        }
    }
}

// Default value functions
fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ProxyConfig {
    /// Configuration serving `bucket` with every other setting at its default
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            storage: StorageConfig {
                bucket: bucket.into(),
                ..StorageConfig::default()
            },
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without validating it, for callers that apply
    /// overrides first
    pub fn read_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.bucket.is_empty() {
            return Err(crate::Error::Config("storage.bucket cannot be empty".into()));
        }
        self.bucket_location()?;

        if self.server.address.is_empty() {
            return Err(crate::Error::Config("server.address cannot be empty".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Parsed bucket location
    pub fn bucket_location(&self) -> crate::Result<BucketLocation> {
        BucketLocation::parse(&self.storage.bucket)
    }
}
