//! Scheduler configuration and bookkeeping in the coordination store
//!
//! Settings, the retained and uploaded tag sets, the upload status and the
//! operation status are separate documents. Read-modify-write of the tag sets
//! happens under the cluster-wide configuration lock.

use super::schedule::ScheduleInterval;
use super::status::{BackupOperationStatus, UploadStatus};
use crate::coordination::store::keys;
use crate::coordination::{CoordinatorStore, LeaseGuard, LeaseManager};
use crate::Result;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Operator-controlled backup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub scheduler_enabled: bool,
    pub interval: ScheduleInterval,
    pub start_offset_minutes: u32,
    /// Number of scheduled backups to keep locally
    pub copies_to_keep: usize,
    /// External file server, `None` disables uploads
    pub upload_url: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            scheduler_enabled: false,
            interval: ScheduleInterval::daily(),
            start_offset_minutes: 0,
            copies_to_keep: 5,
            upload_url: None,
        }
    }
}

impl BackupSettings {
    pub fn validate(&self) -> Result<()> {
        self.interval.validate_offset(self.start_offset_minutes)
    }
}

/// Snapshot of the scheduler configuration, reloaded before every use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub settings: BackupSettings,
    /// Scheduled backups created by the scheduler and still kept
    pub retained_backups: BTreeSet<String>,
    /// Backups already on the external server
    pub uploaded_backups: BTreeSet<String>,
}

impl SchedulerConfig {
    pub fn upload_url(&self) -> Option<&str> {
        self.settings
            .upload_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Lock parameters of the configuration lock
#[derive(Debug, Clone)]
pub struct ConfigLockConfig {
    pub name: String,
    pub ttl: Duration,
    pub wait: Duration,
}

impl Default for ConfigLockConfig {
    fn default() -> Self {
        Self {
            name: "backup-config".to_string(),
            ttl: Duration::from_secs(60),
            wait: Duration::from_secs(5 * 60),
        }
    }
}

/// Loads and persists scheduler documents
pub struct SchedulerConfigStore {
    store: Arc<CoordinatorStore>,
    leases: LeaseManager,
    node_id: String,
    lock: ConfigLockConfig,
}

impl SchedulerConfigStore {
    pub fn new(
        store: Arc<CoordinatorStore>,
        leases: LeaseManager,
        node_id: impl Into<String>,
        lock: ConfigLockConfig,
    ) -> Self {
        Self {
            store,
            leases,
            node_id: node_id.into(),
            lock,
        }
    }

    /// Take the cluster-wide configuration lock.
    pub async fn lock(&self) -> Result<LeaseGuard> {
        self.leases
            .lock(&self.lock.name, &self.node_id, self.lock.ttl, self.lock.wait)
            .await
    }

    pub async fn load(&self) -> Result<SchedulerConfig> {
        let settings = self
            .store
            .load::<BackupSettings>(keys::BACKUP_SETTINGS)
            .await?
            .unwrap_or_default();
        let retained_backups: BTreeSet<String> = self
            .store
            .load(keys::RETAINED_TAGS)
            .await?
            .unwrap_or_default();
        let uploaded_backups: BTreeSet<String> = self
            .store
            .load(keys::UPLOADED_TAGS)
            .await?
            .unwrap_or_default();

        debug!(
            "Loaded scheduler config: enabled={}, interval={}, retained={}, uploaded={}",
            settings.scheduler_enabled,
            settings.interval,
            retained_backups.len(),
            uploaded_backups.len()
        );
        Ok(SchedulerConfig {
            settings,
            retained_backups,
            uploaded_backups,
        })
    }

    pub async fn save_settings(&self, settings: &BackupSettings) -> Result<()> {
        settings.validate()?;
        self.store.save(keys::BACKUP_SETTINGS, settings).await?;
        info!(
            "Saved backup settings: enabled={}, interval={}, offset={}min, keep={}",
            settings.scheduler_enabled,
            settings.interval,
            settings.start_offset_minutes,
            settings.copies_to_keep
        );
        Ok(())
    }

    /// Persist both tag sets. Callers hold the configuration lock.
    pub async fn persist(&self, config: &SchedulerConfig) -> Result<()> {
        self.store
            .save(keys::RETAINED_TAGS, &config.retained_backups)
            .await?;
        self.store
            .save(keys::UPLOADED_TAGS, &config.uploaded_backups)
            .await
    }

    pub async fn upload_status(&self) -> Result<UploadStatus> {
        Ok(self
            .store
            .load(keys::UPLOAD_STATUS)
            .await?
            .unwrap_or_default())
    }

    pub async fn persist_upload_status(&self, status: &UploadStatus) -> Result<()> {
        self.store.save(keys::UPLOAD_STATUS, status).await
    }

    pub async fn operation_status(&self) -> Result<BackupOperationStatus> {
        Ok(self
            .store
            .load(keys::OPERATION_STATUS)
            .await?
            .unwrap_or_default())
    }

    /// Atomically modify the operation status record.
    pub async fn update_operation_status<F>(&self, mut modify: F) -> Result<BackupOperationStatus>
    where
        F: FnMut(&mut BackupOperationStatus),
    {
        self.store
            .update(keys::OPERATION_STATUS, |current: Option<BackupOperationStatus>| {
                let mut status = current.unwrap_or_default();
                modify(&mut status);
                Ok(status)
            })
            .await
    }
}
