//! Audit and alert reporting of backup operations
//!
//! Every backup operation ends in one call to [`BackupReporter::complete`]
//! with the tags that succeeded and the tags that failed. The operation kind
//! selects the audit type and whether failures raise an operator alert.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    CreateBackup,
    UploadBackup,
    DeleteBackup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// A structured audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    /// `[tags, node id, site name]`, plus the error messages on failure
    pub description_params: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

pub trait AlertSink: Send + Sync {
    /// Aggregated upload failures of one upload run.
    fn upload_failed(&self, tags: &str, errors: &str);
}

/// Writes audit records and alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl AuditSink for LogReporter {
    fn record(&self, record: AuditRecord) {
        info!(
            operation = ?record.operation,
            outcome = ?record.outcome,
            params = ?record.description_params,
            "audit"
        );
    }
}

impl AlertSink for LogReporter {
    fn upload_failed(&self, tags: &str, errors: &str) {
        error!("Backup upload failed for {}: {}", tags, errors);
    }
}

/// Kind of backup operation being completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOperation {
    Create,
    Upload,
    Reclaim,
}

impl BackupOperation {
    pub fn audit_operation(&self) -> AuditOperation {
        match self {
            BackupOperation::Create => AuditOperation::CreateBackup,
            BackupOperation::Upload => AuditOperation::UploadBackup,
            BackupOperation::Reclaim => AuditOperation::DeleteBackup,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOperation::Create => "create",
            BackupOperation::Upload => "upload",
            BackupOperation::Reclaim => "reclaim",
        }
    }

    fn alerts_on_failure(&self) -> bool {
        matches!(self, BackupOperation::Upload)
    }
}

/// Single completion path for create, upload and reclaim
#[derive(Clone)]
pub struct BackupReporter {
    audit: Arc<dyn AuditSink>,
    alert: Arc<dyn AlertSink>,
    node_id: String,
    site_name: String,
}

impl BackupReporter {
    pub fn new(
        audit: Arc<dyn AuditSink>,
        alert: Arc<dyn AlertSink>,
        node_id: impl Into<String>,
        site_name: impl Into<String>,
    ) -> Self {
        Self {
            audit,
            alert,
            node_id: node_id.into(),
            site_name: site_name.into(),
        }
    }

    /// Reporter that only logs.
    pub fn logging(node_id: impl Into<String>, site_name: impl Into<String>) -> Self {
        Self::new(Arc::new(LogReporter), Arc::new(LogReporter), node_id, site_name)
    }

    pub fn desc_params(&self, tags: &str) -> Vec<String> {
        vec![tags.to_string(), self.node_id.clone(), self.site_name.clone()]
    }

    /// Report the end of an operation. `failed` pairs each tag with its error.
    pub fn complete(&self, operation: BackupOperation, succeeded: &[String], failed: &[(String, String)]) {
        if !succeeded.is_empty() {
            self.audit.record(AuditRecord {
                operation: operation.audit_operation(),
                outcome: AuditOutcome::Success,
                description_params: self.desc_params(&succeeded.join(", ")),
                timestamp: Utc::now(),
            });
            counter!(
                "custodian_backup_operations_total",
                "service" => crate::telemetry::service(),
                "operation" => operation.as_str(),
                "result" => "ok"
            )
            .increment(succeeded.len() as u64);
        }

        if failed.is_empty() {
            return;
        }

        let tags: Vec<&str> = failed.iter().map(|(tag, _)| tag.as_str()).collect();
        let errors: Vec<&str> = failed.iter().map(|(_, err)| err.as_str()).collect();
        let tags = tags.join(", ");

        let mut params = self.desc_params(&tags);
        params.push(errors.join(", "));
        self.audit.record(AuditRecord {
            operation: operation.audit_operation(),
            outcome: AuditOutcome::Failure,
            description_params: params,
            timestamp: Utc::now(),
        });
        counter!(
            "custodian_backup_operations_total",
            "service" => crate::telemetry::service(),
            "operation" => operation.as_str(),
            "result" => "error"
        )
        .increment(failed.len() as u64);

        if operation.alerts_on_failure() {
            info!("Sending {} failures to operator", operation.as_str());
            self.alert.upload_failed(&tags, &errors.join("\r\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        audits: Mutex<Vec<AuditRecord>>,
        alerts: Mutex<Vec<(String, String)>>,
    }

    impl AuditSink for Recorder {
        fn record(&self, record: AuditRecord) {
            self.audits.lock().push(record);
        }
    }

    impl AlertSink for Recorder {
        fn upload_failed(&self, tags: &str, errors: &str) {
            self.alerts.lock().push((tags.to_string(), errors.to_string()));
        }
    }

    fn reporter(recorder: &Arc<Recorder>) -> BackupReporter {
        BackupReporter::new(recorder.clone(), recorder.clone(), "node1", "site-a")
    }

    #[test]
    fn test_upload_failures_aggregate_into_one_audit_and_alert() {
        let recorder = Arc::new(Recorder::default());
        reporter(&recorder).complete(
            BackupOperation::Upload,
            &["b1".to_string()],
            &[("b2".to_string(), "e2".to_string()), ("b3".to_string(), "e3".to_string())],
        );

        let audits = recorder.audits.lock();
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[0].outcome, AuditOutcome::Success);
        assert_eq!(audits[0].description_params, vec!["b1", "node1", "site-a"]);
        assert_eq!(audits[1].description_params, vec!["b2, b3", "node1", "site-a", "e2, e3"]);

        let alerts = recorder.alerts.lock();
        assert_eq!(alerts.as_slice(), &[("b2, b3".to_string(), "e2\r\ne3".to_string())]);
    }

    #[test]
    fn test_create_failure_does_not_alert() {
        let recorder = Arc::new(Recorder::default());
        reporter(&recorder).complete(
            BackupOperation::Create,
            &[],
            &[("t".to_string(), "disk full".to_string())],
        );
        assert_eq!(recorder.audits.lock()[0].operation, AuditOperation::CreateBackup);
        assert!(recorder.alerts.lock().is_empty());
    }
}
