//! Creation and reclamation of scheduled backups

use super::report::BackupOperation;
use super::schedule::ScheduleCalculator;
use super::tag::ScheduledBackupTag;
use super::BackupContext;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at creating one scheduled backup
pub const CREATE_ATTEMPTS: u32 = 3;

pub struct BackupExecutor {
    ctx: BackupContext,
    retry_delay: Duration,
}

impl BackupExecutor {
    pub fn new(ctx: BackupContext, retry_delay: Duration) -> Self {
        Self { ctx, retry_delay }
    }

    /// Create the scheduled backup that is due, if any.
    ///
    /// A backup is due when no retained scheduled backup was taken at or after
    /// the latest scheduled instant.
    pub async fn create(&self) -> Result<Option<String>> {
        let guard = self.ctx.config.lock().await?;
        let result = self.create_locked().await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release configuration lock after backup: {}", e);
        }
        result
    }

    async fn create_locked(&self) -> Result<Option<String>> {
        let mut config = self.ctx.config.load().await?;
        let settings = &config.settings;
        if !settings.scheduler_enabled {
            debug!("Backup scheduler disabled, not creating a backup");
            return Ok(None);
        }

        let now = self.ctx.clock.now();
        let offset = settings.start_offset_minutes;
        let due = ScheduleCalculator::last_run(&settings.interval, offset, now)?;
        let next = ScheduleCalculator::next_run(&settings.interval, offset, now)?;
        if let Some(latest) = config
            .retained_backups
            .iter()
            .filter_map(|t| ScheduledBackupTag::parse_time(t))
            .max()
            .filter(|t| *t >= due)
        {
            info!("Scheduled backup of {} is up to date", latest);
            return Ok(None);
        }

        let nodes = self.ctx.topology.controller_nodes().await?.len();
        let tag = ScheduledBackupTag::format(&self.ctx.software_version, nodes, now);
        let outcome = self.create_with_retries(&tag).await;
        let success = outcome.is_ok();

        match &outcome {
            Ok(()) => {
                config.retained_backups.insert(tag.clone());
                self.ctx.config.persist(&config).await?;
                self.ctx
                    .reporter
                    .complete(BackupOperation::Create, &[tag.clone()], &[]);
            }
            Err(msg) => self.ctx.reporter.complete(
                BackupOperation::Create,
                &[],
                &[(tag.clone(), msg.clone())],
            ),
        }

        self.record_creation(&tag, now, success, Some(next)).await;

        match outcome {
            Ok(()) => Ok(Some(tag)),
            Err(msg) => Err(Error::Backup(format!("failed to create {}: {}", tag, msg))),
        }
    }

    async fn create_with_retries(&self, tag: &str) -> std::result::Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=CREATE_ATTEMPTS {
            match self.ctx.storage.create_backup(tag).await {
                Ok(()) => {
                    info!("Created scheduled backup {}", tag);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Attempt {}/{} to create {} failed: {}", attempt, CREATE_ATTEMPTS, tag, e);
                    last_error = e.to_string();
                    // Leftovers of a partial backup would fail the next attempt
                    if let Err(e) = self.ctx.storage.delete_backup(tag).await {
                        debug!("Could not clean up partial backup {}: {}", tag, e);
                    }
                    if attempt < CREATE_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn record_creation(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        success: bool,
        next: Option<DateTime<Utc>>,
    ) {
        let result = self
            .ctx
            .config
            .update_operation_status(|s| {
                s.record_creation(tag, time, true, success);
                if next.is_some() {
                    s.next_scheduled_creation = next;
                }
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to record creation of {}: {}", tag, e);
        }
    }

    /// Delete scheduled backups beyond `copies_to_keep`, and scheduled backups
    /// on disk that are not retained. A retained backup is only deleted once it
    /// is uploaded, unless no upload server is configured.
    pub async fn reclaim(&self) -> Result<Vec<String>> {
        let guard = self.ctx.config.lock().await?;
        let result = self.reclaim_locked().await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release configuration lock after reclaim: {}", e);
        }
        result
    }

    async fn reclaim_locked(&self) -> Result<Vec<String>> {
        let mut config = self.ctx.config.load().await?;
        let upload_configured = config.upload_url().is_some();

        let mut retained: Vec<(Option<DateTime<Utc>>, String)> = config
            .retained_backups
            .iter()
            .map(|t| (ScheduledBackupTag::parse_time(t), t.clone()))
            .collect();
        // Newest first; tags without a time sort last
        retained.sort_by(|a, b| b.cmp(a));

        let mut doomed: BTreeSet<String> = BTreeSet::new();
        for (_, tag) in retained.iter().skip(config.settings.copies_to_keep) {
            if !upload_configured || config.uploaded_backups.contains(tag) {
                doomed.insert(tag.clone());
            } else {
                debug!("Keeping {} until it is uploaded", tag);
            }
        }

        let on_disk = self.ctx.storage.cluster_backup_tags(true).await?;
        let orphans = ScheduledBackupTag::pick_scheduled(on_disk.iter());
        doomed.extend(
            orphans
                .into_iter()
                .filter(|t| !config.retained_backups.contains(t)),
        );

        if doomed.is_empty() {
            debug!("No scheduled backups to reclaim");
            return Ok(Vec::new());
        }

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for tag in doomed {
            match self.ctx.storage.delete_backup(&tag).await {
                Ok(()) => {
                    config.retained_backups.remove(&tag);
                    deleted.push(tag);
                }
                Err(e) => {
                    warn!("Failed to reclaim backup {}: {}", tag, e);
                    failed.push((tag, e.to_string()));
                }
            }
        }

        self.ctx.config.persist(&config).await?;
        info!("Reclaimed {} scheduled backups", deleted.len());
        self.ctx
            .reporter
            .complete(BackupOperation::Reclaim, &deleted, &failed);
        Ok(deleted)
    }
}
