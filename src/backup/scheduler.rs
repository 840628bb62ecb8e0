//! Leader-only backup scheduling
//!
//! The scheduler does nothing until it is told it leads. Each leadership term
//! gets its own worker task that runs a backup cycle immediately and then at
//! every scheduled instant. Losing leadership cancels the worker without
//! waiting for it.

use super::executor::BackupExecutor;
use super::schedule::ScheduleCalculator;
use super::upload::{UploadExecutor, UploadPolicy};
use super::BackupContext;
use crate::coordination::LeadershipListener;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before retrying when the next run could not be scheduled
pub const DEFAULT_RETRY_OFFSET: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
enum Command {
    /// Settings changed: reload, run and reschedule
    Reconfigure,
}

struct Worker {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

struct Inner {
    ctx: BackupContext,
    backups: BackupExecutor,
    uploads: UploadExecutor,
    is_leader: AtomicBool,
    worker: Mutex<Option<Worker>>,
    next_run: Mutex<Option<DateTime<Utc>>>,
    retry_offset: Duration,
}

/// Creates, uploads and reclaims backups while this node leads
#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<Inner>,
}

impl BackupScheduler {
    pub fn new(ctx: BackupContext, policy: UploadPolicy) -> Self {
        Self::with_retry_offset(ctx, policy, DEFAULT_RETRY_OFFSET)
    }

    pub fn with_retry_offset(
        ctx: BackupContext,
        policy: UploadPolicy,
        retry_offset: Duration,
    ) -> Self {
        let backups = BackupExecutor::new(ctx.clone(), policy.retry_delay);
        let uploads = UploadExecutor::new(ctx.clone(), policy);
        Self {
            inner: Arc::new(Inner {
                ctx,
                backups,
                uploads,
                is_leader: AtomicBool::new(false),
                worker: Mutex::new(None),
                next_run: Mutex::new(None),
                retry_offset,
            }),
        }
    }

    pub fn upload_executor(&self) -> &UploadExecutor {
        &self.inner.uploads
    }

    pub fn backup_executor(&self) -> &BackupExecutor {
        &self.inner.backups
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// When the worker runs next, `None` when idle or not leading.
    pub fn next_scheduled_run_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.next_run.lock()
    }

    /// Settings changed; the leader reloads and reschedules. Ignored elsewhere.
    pub fn notify_config_changed(&self) {
        if !self.is_leader() {
            debug!("Not the backup leader, ignoring configuration change");
            return;
        }
        if let Some(worker) = self.inner.worker.lock().as_ref() {
            if worker.commands.send(Command::Reconfigure).is_err() {
                warn!("Backup scheduler worker is gone, configuration change dropped");
            }
        }
    }

    /// Stop leading and wait for the worker to exit.
    pub async fn shutdown(&self) {
        self.stop_leadership();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.handle.await;
        }
    }
}

#[async_trait]
impl LeadershipListener for BackupScheduler {
    async fn start_leadership(&self) {
        info!("Backup scheduler is now the leader");
        self.inner.is_leader.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Command::Reconfigure);
        let handle = tokio::spawn(worker_loop(self.inner.clone(), cancel.clone(), rx));

        let previous = self.inner.worker.lock().replace(Worker {
            cancel,
            commands: tx,
            handle,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn stop_leadership(&self) {
        if self.inner.is_leader.swap(false, Ordering::SeqCst) {
            info!("Backup scheduler is no longer the leader");
        }
        if let Some(worker) = self.inner.worker.lock().as_ref() {
            worker.cancel.cancel();
        }
        *self.inner.next_run.lock() = None;
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut wake_at: Option<Instant> = None;
    loop {
        let due = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Reconfigure) => wake_at = inner.configure().await,
                None => break,
            },
            _ = due => wake_at = inner.run_cycle().await,
        }
    }
    debug!("Backup scheduler worker stopped");
}

impl Inner {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn configure(&self) -> Option<Instant> {
        match self.ctx.config.load().await {
            Ok(config) if config.upload_url().is_none() && !config.settings.scheduler_enabled => {
                info!("Backup scheduler disabled and no upload server configured, nothing to do");
                *self.next_run.lock() = None;
                None
            }
            Ok(_) => self.run_cycle().await,
            Err(e) => {
                warn!("Failed to load backup configuration: {}", e);
                self.retry_later()
            }
        }
    }

    /// Create, upload and reclaim, then schedule the next cycle.
    async fn run_cycle(&self) -> Option<Instant> {
        if !self.is_leader() {
            return None;
        }
        counter!(
            "custodian_backup_cycles_total",
            "service" => crate::telemetry::service()
        )
        .increment(1);

        if let Err(e) = self.backups.create().await {
            warn!("Scheduled backup creation failed: {}", e);
        }
        if let Err(e) = self.uploads.upload(None, false).await {
            warn!("Backup upload failed: {}", e);
        }
        if let Err(e) = self.backups.reclaim().await {
            warn!("Backup reclamation failed: {}", e);
        }
        self.schedule_next_run().await
    }

    async fn schedule_next_run(&self) -> Option<Instant> {
        if !self.is_leader() {
            return None;
        }
        let config = match self.ctx.config.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to reload backup configuration: {}", e);
                return self.retry_later();
            }
        };
        if config.upload_url().is_none() && !config.settings.scheduler_enabled {
            *self.next_run.lock() = None;
            return None;
        }

        let now = self.ctx.clock.now();
        let settings = &config.settings;
        let next = match ScheduleCalculator::next_run(
            &settings.interval,
            settings.start_offset_minutes,
            now,
        ) {
            Ok(next) => next,
            Err(e) => {
                warn!("Failed to compute next backup time: {}", e);
                return self.retry_later();
            }
        };

        if settings.scheduler_enabled {
            let result = self
                .ctx
                .config
                .update_operation_status(|s| s.next_scheduled_creation = Some(next))
                .await;
            if let Err(e) = result {
                warn!("Failed to record next backup time: {}", e);
            }
        }

        info!("Next backup cycle at {}", next);
        *self.next_run.lock() = Some(next);
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + delay)
    }

    fn retry_later(&self) -> Option<Instant> {
        if !self.is_leader() {
            return None;
        }
        let offset = chrono::Duration::from_std(self.retry_offset)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let retry_at = self.ctx.clock.now() + offset;
        *self.next_run.lock() = Some(retry_at);
        Some(Instant::now() + self.retry_offset)
    }
}
