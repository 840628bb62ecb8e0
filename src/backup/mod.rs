//! Scheduled backups and uploads
//!
//! The [`BackupScheduler`] runs on the elected leader only. Each cycle it
//! creates the scheduled backup that is due, uploads everything not yet on the
//! external file server and reclaims old scheduled backups. All shared state
//! lives in the coordination store and is changed under a cluster lock.

pub mod config;
pub mod executor;
pub mod naming;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod tag;
pub mod transport;
pub mod upload;

pub use config::{BackupSettings, ConfigLockConfig, SchedulerConfig, SchedulerConfigStore};
pub use executor::BackupExecutor;
pub use naming::{FileState, RemoteFileName};
pub use report::{AlertSink, AuditRecord, AuditSink, BackupOperation, BackupReporter, LogReporter};
pub use schedule::{ScheduleCalculator, ScheduleInterval, ScheduleUnit};
pub use scheduler::BackupScheduler;
pub use status::{BackupOperationStatus, UploadErrorCode, UploadState, UploadStatus};
pub use storage::{BackupFile, BackupFileSet, BackupStorage, BackupStream, FsBackupStorage};
pub use tag::ScheduledBackupTag;
pub use transport::{FsTransport, RemoteTransport, TransportFactory, UrlTransportFactory};
pub use upload::{UploadExecutor, UploadPolicy, UploadReport};

use crate::clock::Clock;
use crate::cluster::ClusterTopology;
use std::sync::Arc;

/// Collaborators shared by the backup executors
#[derive(Clone)]
pub struct BackupContext {
    pub config: Arc<SchedulerConfigStore>,
    pub storage: Arc<dyn BackupStorage>,
    pub topology: Arc<dyn ClusterTopology>,
    pub transports: Arc<dyn TransportFactory>,
    pub reporter: BackupReporter,
    pub clock: Arc<dyn Clock>,
    /// Software version embedded in scheduled backup tags
    pub software_version: String,
}
