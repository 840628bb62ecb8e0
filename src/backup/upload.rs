//! Resumable uploads of backups to the external file server
//!
//! An upload streams the backup's tar archive into `<name>.tar.incomplete`
//! and renames it once the stream is complete. A retried or later upload of
//! the same backup resumes at the size the incomplete file already has, since
//! the archive of an unchanged file set is byte-for-byte identical.
//!
//! Uploaded tags are recorded in the coordination store, so uploading a tag a
//! second time does nothing and touches no remote file.

use super::config::SchedulerConfig;
use super::naming::{self, FileState, RemoteFileName};
use super::report::BackupOperation;
use super::status::{UploadErrorCode, UploadState, UploadStatus};
use super::storage::BackupFileSet;
use super::tag::ScheduledBackupTag;
use super::transport::RemoteTransport;
use super::BackupContext;
use crate::{Error, Result};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry policy of one tag's upload
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Result of one upload run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub succeeded: Vec<String>,
    /// Failed tags with the last error of each
    pub failed: Vec<(String, String)>,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

enum AttemptError {
    /// Retrying cannot help
    Fatal(UploadErrorCode, String),
    Transient(String),
}

impl From<Error> for AttemptError {
    fn from(e: Error) -> Self {
        AttemptError::Transient(e.to_string())
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Transient(e.to_string())
    }
}

pub struct UploadExecutor {
    ctx: BackupContext,
    policy: UploadPolicy,
    pending: Mutex<BTreeSet<String>>,
}

impl UploadExecutor {
    pub fn new(ctx: BackupContext, policy: UploadPolicy) -> Self {
        Self {
            ctx,
            policy,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Upload `tag`, or every backup not yet uploaded when `tag` is `None`.
    ///
    /// With `force`, a backup whose archive is already complete on the server
    /// is uploaded again under a unique name.
    pub async fn upload(&self, tag: Option<&str>, force: bool) -> Result<UploadReport> {
        let config = self.ctx.config.load().await?;
        let Some(url) = config.upload_url().map(str::to_string) else {
            info!("No upload server configured, skipping upload");
            return Ok(UploadReport::default());
        };
        let transport = self.ctx.transports.create(&url)?;

        let guard = self.ctx.config.lock().await?;
        let result = self.upload_locked(transport.as_ref(), tag, force, guard.lost()).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release configuration lock after upload: {}", e);
        }
        result
    }

    async fn upload_locked(
        &self,
        transport: &dyn RemoteTransport,
        tag: Option<&str>,
        force: bool,
        lock_lost: CancellationToken,
    ) -> Result<UploadReport> {
        let mut config = self.ctx.config.load().await?;
        self.cleanup_completed_tags(&mut config).await?;
        let candidates = self.candidates(&config).await?;

        let tags: Vec<String> = match tag {
            Some(t) if !candidates.contains(t) => {
                info!("Backup {} is already uploaded", t);
                return Ok(UploadReport::default());
            }
            Some(t) => vec![t.to_string()],
            None => candidates.into_iter().collect(),
        };
        if tags.is_empty() {
            debug!("No backups to upload");
            return Ok(UploadReport::default());
        }

        info!("Uploading {} backups to {}", tags.len(), transport.endpoint());
        let mut report = UploadReport::default();
        let mut persist_error = None;
        for tag in tags {
            if lock_lost.is_cancelled() {
                warn!("Configuration lock lost, stopping upload before {}", tag);
                break;
            }

            let result = self.try_upload(transport, &tag, force).await;
            let success = result.is_ok();
            match result {
                Ok(()) => {
                    config.uploaded_backups.insert(tag.clone());
                    report.succeeded.push(tag.clone());
                    if let Err(e) = self.ctx.config.persist(&config).await {
                        error!("Failed to record upload of {}: {}", tag, e);
                        persist_error = Some(e);
                    }
                }
                Err(msg) => report.failed.push((tag.clone(), msg)),
            }

            let now = self.ctx.clock.now();
            if let Err(e) = self
                .ctx
                .config
                .update_operation_status(|s| s.record_upload(&tag, now, success))
                .await
            {
                warn!("Failed to record upload status of {}: {}", tag, e);
            }
            if persist_error.is_some() {
                break;
            }
        }

        self.ctx
            .reporter
            .complete(BackupOperation::Upload, &report.succeeded, &report.failed);
        match persist_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Forget uploaded tags whose backups are neither retained nor still present
    /// as manual backups.
    async fn cleanup_completed_tags(&self, config: &mut SchedulerConfig) -> Result<()> {
        let cluster = self.ctx.storage.cluster_backup_tags(true).await?;
        let scheduled = ScheduledBackupTag::pick_scheduled(cluster.iter());
        let manual: BTreeSet<&String> = cluster.difference(&scheduled).collect();

        let retained = config.retained_backups.clone();
        let before = config.uploaded_backups.len();
        config
            .uploaded_backups
            .retain(|t| retained.contains(t) || manual.contains(t));

        if config.uploaded_backups.len() != before {
            debug!(
                "Dropped {} reclaimed tags from uploaded backups",
                before - config.uploaded_backups.len()
            );
            self.ctx.config.persist(config).await?;
        }
        Ok(())
    }

    /// Manual backups plus retained scheduled backups, minus what is uploaded.
    async fn candidates(&self, config: &SchedulerConfig) -> Result<BTreeSet<String>> {
        let cluster = self.ctx.storage.cluster_backup_tags(true).await?;
        let scheduled = ScheduledBackupTag::pick_scheduled(cluster.iter());

        let mut candidates: BTreeSet<String> = cluster.difference(&scheduled).cloned().collect();
        candidates.extend(config.retained_backups.iter().cloned());
        candidates.retain(|t| !config.uploaded_backups.contains(t));
        Ok(candidates)
    }

    async fn try_upload(
        &self,
        transport: &dyn RemoteTransport,
        tag: &str,
        force: bool,
    ) -> std::result::Result<(), String> {
        self.set_status(UploadStatus::new(tag, UploadState::Pending, None, None))
            .await;

        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            self.set_status(UploadStatus::new(tag, UploadState::InProgress, Some(0), None))
                .await;
            self.pending.lock().remove(tag);

            let started = Instant::now();
            match self.upload_once(transport, tag, force).await {
                Ok(name) => {
                    info!("Uploaded backup {} as {} in {:?}", tag, name, started.elapsed());
                    histogram!(
                        "custodian_upload_duration_seconds",
                        "service" => crate::telemetry::service()
                    )
                    .record(started.elapsed().as_secs_f64());
                    self.set_status(UploadStatus::new(tag, UploadState::Done, Some(100), None))
                        .await;
                    return Ok(());
                }
                Err(AttemptError::Fatal(code, msg)) => {
                    warn!("Upload of {} failed: {}", tag, msg);
                    self.set_status(UploadStatus::failed(tag, code)).await;
                    return Err(msg);
                }
                Err(AttemptError::Transient(msg)) => {
                    warn!("Upload attempt {}/{} of {} failed: {}", attempt, attempts, tag, msg);
                    counter!(
                        "custodian_upload_retries_total",
                        "service" => crate::telemetry::service()
                    )
                    .increment(1);
                    last_error = msg;
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        self.set_status(UploadStatus::failed(tag, UploadErrorCode::UploadFailure))
            .await;
        Err(last_error)
    }

    /// One attempt; returns the final remote file name.
    async fn upload_once(
        &self,
        transport: &dyn RemoteTransport,
        tag: &str,
        force: bool,
    ) -> std::result::Result<String, AttemptError> {
        let files = self.ctx.storage.download_files(tag).await?;
        if files.is_empty() {
            return Err(AttemptError::Fatal(
                UploadErrorCode::BackupNotExist,
                format!("backup {} does not exist", tag),
            ));
        }
        let controllers = self.ctx.topology.controller_nodes().await?;
        if !files.is_valid(controllers.len()) {
            return Err(AttemptError::Fatal(
                UploadErrorCode::InvalidBackup,
                format!(
                    "backup {} covers {} of {} nodes",
                    tag,
                    files.unique_nodes().len(),
                    controllers.len()
                ),
            ));
        }

        let expected = self.remote_name(tag, &files, &controllers);
        let mut name = expected.file_name();
        if self.has_complete_file_on_server(transport, &expected).await? {
            if !force {
                return Err(AttemptError::Fatal(
                    UploadErrorCode::RemoteAlreadyExist,
                    format!("backup {} already exists on {}", tag, transport.endpoint()),
                ));
            }
            name = naming::deduplicated(&name, self.ctx.clock.now().timestamp_millis());
            info!("Backup {} is already on the server, uploading again as {}", tag, name);
        }

        let offset = transport.file_size(&name).await?.unwrap_or(0);
        if offset > 0 {
            info!("Resuming upload of {} at byte {}", name, offset);
        }

        let mut stream = self.ctx.storage.open_stream(&files, offset).await?;
        let mut writer = transport.open_upload(&name, offset).await?;
        let copied = tokio::io::copy(&mut stream.reader, &mut writer).await;
        let closed = writer.shutdown().await;
        let produced = stream.finish().await;

        let copied = copied?;
        closed?;
        produced?;
        counter!(
            "custodian_upload_bytes_total",
            "service" => crate::telemetry::service()
        )
        .increment(copied);

        let finished = naming::finished_name(&name, true);
        transport.rename(&name, &finished).await?;
        Ok(finished)
    }

    fn remote_name(
        &self,
        tag: &str,
        files: &BackupFileSet,
        controllers: &BTreeSet<String>,
    ) -> RemoteFileName {
        let available = files
            .unique_nodes()
            .iter()
            .filter(|node| controllers.contains(*node))
            .count();
        RemoteFileName::new(tag, controllers.len(), available, self.ctx.topology.site_id())
    }

    /// Whether a complete archive of the tag exists. Incomplete archives whose
    /// node counts differ from `expected` can never be resumed and are renamed
    /// to the invalid suffix.
    async fn has_complete_file_on_server(
        &self,
        transport: &dyn RemoteTransport,
        expected: &RemoteFileName,
    ) -> Result<bool> {
        let mut complete = false;
        for file in transport.list_files(&naming::tag_prefix(&expected.tag)).await? {
            match FileState::of(&file) {
                Some(FileState::Complete) => complete = true,
                Some(FileState::Incomplete) => {
                    let Some(remote) = RemoteFileName::parse(&expected.tag, &file) else {
                        // Another tag sharing this prefix, or a foreign file
                        continue;
                    };
                    if remote.total_nodes != expected.total_nodes
                        || remote.available_nodes != expected.available_nodes
                    {
                        info!("Invalidating stale partial upload {}", file);
                        transport
                            .rename(&file, &naming::finished_name(&file, false))
                            .await?;
                    }
                }
                Some(FileState::Invalid) | None => {}
            }
        }
        Ok(complete)
    }

    async fn set_status(&self, status: UploadStatus) {
        if let Err(e) = self.ctx.config.persist_upload_status(&status).await {
            warn!("Failed to persist upload status: {}", e);
        }
    }

    /// Status of the upload of `tag`.
    pub async fn upload_status(&self, tag: &str) -> Result<UploadStatus> {
        let config = self.ctx.config.load().await?;
        if config.uploaded_backups.contains(tag) {
            return Ok(UploadStatus::new(tag, UploadState::Done, Some(100), None));
        }

        if !self.candidates(&config).await?.contains(tag) {
            let on_disk = self.ctx.storage.cluster_backup_tags(true).await?.contains(tag);
            let code = if on_disk {
                UploadErrorCode::ToBeReclaimed
            } else {
                UploadErrorCode::BackupNotExist
            };
            return Ok(UploadStatus::failed(tag, code));
        }

        if config.upload_url().is_none() {
            return Ok(UploadStatus::failed(tag, UploadErrorCode::UploadNotConfigured));
        }

        let current = self.ctx.config.upload_status().await?;
        if current.backup_name.as_deref() == Some(tag) {
            return Ok(current);
        }
        if self.is_pending_upload_task(tag) {
            return Ok(UploadStatus::new(tag, UploadState::Pending, None, None));
        }
        Ok(UploadStatus::new(tag, UploadState::NotStarted, None, None))
    }

    /// Mark `tag` as queued for upload; cleared when its upload starts.
    pub fn add_pending_upload_task(&self, tag: &str) {
        self.pending.lock().insert(tag.to_string());
    }

    pub fn is_pending_upload_task(&self, tag: &str) -> bool {
        self.pending.lock().contains(tag)
    }
}
