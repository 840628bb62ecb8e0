//! Coordination store backed by an object store
//!
//! Every coordination document (leases, repair checkpoints, scheduler settings,
//! upload bookkeeping) is a small JSON object. Writers use conditional puts on
//! the object's ETag so that concurrent nodes never silently overwrite each
//! other.

use crate::{Error, Result};

use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum number of CAS retries for atomic operations
pub const MAX_CAS_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds for exponential backoff
pub const BASE_BACKOFF_MS: u64 = 100;

/// ETag placeholder for a document that does not exist yet
pub const NO_VERSION: &str = "none";

/// Document keys
pub mod keys {
    pub const BACKUP_SETTINGS: &str = "backup/settings";
    pub const RETAINED_TAGS: &str = "backup/retained-tags";
    pub const UPLOADED_TAGS: &str = "backup/uploaded-tags";
    pub const UPLOAD_STATUS: &str = "backup/upload-status";
    pub const OPERATION_STATUS: &str = "backup/operation-status";

    pub fn repair_checkpoint(keyspace: &str) -> String {
        format!("repair/{}/checkpoint", keyspace)
    }

    pub fn lease(name: &str) -> String {
        format!("leases/{}", name)
    }
}

/// Coordination store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key prefix inside the object store
    pub prefix: String,
    /// Fall back to blind overwrites when the backend has no conditional puts.
    /// Only safe with a single writer.
    pub allow_unsafe_overwrite: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "custodian/".to_string(),
            allow_unsafe_overwrite: false,
        }
    }
}

/// JSON document store with compare-and-swap writes
pub struct CoordinatorStore {
    object_store: Arc<dyn ObjectStore>,
    config: StoreConfig,
}

impl CoordinatorStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: StoreConfig) -> Self {
        Self {
            object_store,
            config,
        }
    }

    /// In-memory store, for tests and single-process development.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            StoreConfig::default(),
        )
    }

    fn path(&self, key: &str) -> Path {
        Path::from(format!("{}{}", self.config.prefix, key))
    }

    /// Load a document together with its ETag.
    ///
    /// A missing document yields `(None, NO_VERSION)`.
    pub async fn load_with_etag<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<(Option<T>, String)> {
        let path = self.path(key);
        match self.object_store.get(&path).await {
            Ok(result) => {
                let e_tag = result
                    .meta
                    .e_tag
                    .clone()
                    .unwrap_or_else(|| "no-etag".to_string());
                let bytes = result.bytes().await?;
                let value: T = serde_json::from_slice(&bytes).map_err(|e| {
                    warn!("Corrupt coordination document {}: {}", key, e);
                    Error::Serialization(format!("corrupt document {}: {}", key, e))
                })?;
                debug!("Loaded {} with ETag: {}", key, e_tag);
                Ok((Some(value), e_tag))
            }
            Err(object_store::Error::NotFound { .. }) => Ok((None, NO_VERSION.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.load_with_etag(key).await?.0)
    }

    /// Write a document only if it still carries `expected_etag`.
    ///
    /// Returns `Error::Conflict` when another writer got there first.
    pub async fn save_with_cas<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected_etag: &str,
    ) -> Result<()> {
        let path = self.path(key);
        let payload = PutPayload::from(serde_json::to_vec_pretty(value)?);
        let cas_start = Instant::now();

        let opts = if expected_etag == NO_VERSION {
            PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            }
        } else {
            PutOptions {
                mode: PutMode::Update(object_store::UpdateVersion {
                    e_tag: Some(expected_etag.to_string()),
                    version: None,
                }),
                ..Default::default()
            }
        };

        match self.object_store.put_opts(&path, payload.clone(), opts).await {
            Ok(_) => {
                counter!(
                    "custodian_store_cas_attempts_total",
                    "service" => crate::telemetry::service(),
                    "result" => "ok"
                )
                .increment(1);
                histogram!(
                    "custodian_store_cas_duration_seconds",
                    "service" => crate::telemetry::service()
                )
                .record(cas_start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                counter!(
                    "custodian_store_cas_attempts_total",
                    "service" => crate::telemetry::service(),
                    "result" => "conflict"
                )
                .increment(1);
                Err(Error::Conflict)
            }
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                if !self.config.allow_unsafe_overwrite {
                    return Err(Error::Config(format!(
                        "conditional writes are required for {} but are not supported by the object store",
                        key
                    )));
                }
                warn!(
                    "CAS not supported for {}, falling back to unsafe overwrite",
                    key
                );
                self.object_store.put(&path, payload).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unconditionally replace a document.
    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = PutPayload::from(serde_json::to_vec_pretty(value)?);
        self.object_store.put(&self.path(key), payload).await?;
        Ok(())
    }

    /// Delete a document; deleting a missing document is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.object_store.delete(&self.path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load-modify-save with CAS retries and exponential backoff.
    ///
    /// `modify` receives the current value (`None` when absent) and returns the
    /// value to store. Any error other than a conflict aborts immediately.
    pub async fn update<T, F>(&self, key: &str, mut modify: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<T>,
    {
        for attempt in 0..MAX_CAS_RETRIES {
            let (current, etag) = self.load_with_etag::<T>(key).await?;
            let next = modify(current)?;
            match self.save_with_cas(key, &next, &etag).await {
                Ok(()) => return Ok(next),
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(attempt);
                    counter!(
                        "custodian_store_cas_retries_total",
                        "service" => crate::telemetry::service()
                    )
                    .increment(1);
                    debug!(
                        "CAS conflict on {} attempt {}, retrying after {}ms",
                        key,
                        attempt + 1,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::TooManyRetries)
    }
}
