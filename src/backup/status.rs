//! Upload and backup operation status records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the most recent upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    Pending,
    InProgress,
    Done,
    Failed,
    #[default]
    NotStarted,
}

/// Why an upload failed or cannot happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadErrorCode {
    BackupNotExist,
    InvalidBackup,
    RemoteAlreadyExist,
    UploadFailure,
    ToBeReclaimed,
    UploadNotConfigured,
}

/// Cluster-wide status of the last upload attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub backup_name: Option<String>,
    pub status: UploadState,
    pub progress: Option<u8>,
    pub error_code: Option<UploadErrorCode>,
}

impl UploadStatus {
    pub fn new(
        backup_name: &str,
        status: UploadState,
        progress: Option<u8>,
        error_code: Option<UploadErrorCode>,
    ) -> Self {
        Self {
            backup_name: Some(backup_name.to_string()),
            status,
            progress,
            error_code,
        }
    }

    pub fn failed(backup_name: &str, error_code: UploadErrorCode) -> Self {
        Self::new(backup_name, UploadState::Failed, Some(0), Some(error_code))
    }

    /// Supersede the record; a `None` name keeps the current one.
    pub fn update(
        &mut self,
        backup_name: Option<&str>,
        status: UploadState,
        progress: Option<u8>,
        error_code: Option<UploadErrorCode>,
    ) {
        if let Some(name) = backup_name {
            self.backup_name = Some(name.to_string());
        }
        self.status = status;
        self.progress = progress;
        self.error_code = error_code;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationOutcome {
    Success,
    Failed,
}

impl OperationOutcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            OperationOutcome::Success
        } else {
            OperationOutcome::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub name: String,
    pub time: DateTime<Utc>,
    pub outcome: OperationOutcome,
}

/// Last creations and uploads, plus the next scheduled creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOperationStatus {
    pub last_manual_creation: Option<OperationRecord>,
    pub last_scheduled_creation: Option<OperationRecord>,
    pub last_successful_creation: Option<OperationRecord>,
    pub last_upload: Option<OperationRecord>,
    pub next_scheduled_creation: Option<DateTime<Utc>>,
}

impl BackupOperationStatus {
    pub fn record_creation(&mut self, name: &str, time: DateTime<Utc>, scheduled: bool, success: bool) {
        let record = OperationRecord {
            name: name.to_string(),
            time,
            outcome: OperationOutcome::from_success(success),
        };
        if success {
            self.last_successful_creation = Some(record.clone());
        }
        if scheduled {
            self.last_scheduled_creation = Some(record);
        } else {
            self.last_manual_creation = Some(record);
        }
    }

    pub fn record_upload(&mut self, name: &str, time: DateTime<Utc>, success: bool) {
        self.last_upload = Some(OperationRecord {
            name: name.to_string(),
            time,
            outcome: OperationOutcome::from_success(success),
        });
    }
}
