//! Component factory for environment-based configuration
//!
//! This module builds the coordination store from environment variables,
//! enabling easy switching between development and production configurations.

use crate::coordination::{CoordinatorStore, StoreConfig};
use crate::Result;
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Backends for the coordination object store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Local,
    S3,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }

    /// Whether the backend supports conditional updates.
    pub fn supports_cas(&self) -> bool {
        !matches!(self, Self::Local)
    }

    pub fn from_env() -> Result<Self> {
        std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" | "fs" => Ok(Self::Local),
            "s3" | "aws" => Ok(Self::S3),
            other => Err(crate::Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                other
            ))),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| {
        let value = value.trim();
        value == "1" || value.eq_ignore_ascii_case("true")
    })
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "local" or "s3"
    /// - LOCAL_STORE_PATH: directory of the local store (default: ./custodian-data)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub async fn create_object_store(backend: StorageBackend) -> Result<Arc<dyn ObjectStore>> {
        match backend {
            StorageBackend::Memory => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            StorageBackend::Local => {
                let path = std::env::var("LOCAL_STORE_PATH")
                    .unwrap_or_else(|_| "./custodian-data".to_string());
                tokio::fs::create_dir_all(&path).await?;
                info!("Using local object store at {}", path);
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
            }
            StorageBackend::S3 => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    crate::Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(
                    "Using S3 object store: bucket={}, region={}",
                    bucket, region
                );

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // Support custom endpoints (MinIO, LocalStack)
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
        }
    }

    /// Create the coordination store from environment
    ///
    /// Environment variables, besides those of [`Self::create_object_store`]:
    /// - STORE_PREFIX: key prefix (default: custodian/)
    /// - STORE_ALLOW_UNSAFE_OVERWRITE: blind overwrites when the backend has no
    ///   conditional puts (default: true for local, false otherwise)
    pub async fn create_coordinator_store() -> Result<Arc<CoordinatorStore>> {
        let backend = StorageBackend::from_env()?;
        let object_store = Self::create_object_store(backend).await?;
        Ok(Arc::new(CoordinatorStore::new(
            object_store,
            Self::store_config(backend),
        )))
    }

    pub fn store_config(backend: StorageBackend) -> StoreConfig {
        let defaults = StoreConfig::default();
        let allow_unsafe_overwrite =
            env_flag("STORE_ALLOW_UNSAFE_OVERWRITE").unwrap_or(!backend.supports_cas());
        if allow_unsafe_overwrite {
            warn!(
                "Coordination store on {} uses unconditional overwrites; run a single writer",
                backend.as_str()
            );
        }
        StoreConfig {
            prefix: std::env::var("STORE_PREFIX").unwrap_or(defaults.prefix),
            allow_unsafe_overwrite,
        }
    }
}
