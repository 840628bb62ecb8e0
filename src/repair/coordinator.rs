//! Sequential repair of the local node's primary ranges
//!
//! A run walks the [`TokenRangeSet`] in order, one [`RepairSession`] per
//! range, persisting a checkpoint after every completed range. The cluster
//! state digest captured at the start of the run must hold for every range;
//! if membership changes mid-run the run fails and the next run starts over.

use super::monitor::HangMonitor;
use super::session::{RepairSession, SessionOutcome};
use super::state::{RepairPhase, RepairRunState, RepairShared};
use super::{NotificationSender, RepairFacility, RepairNotification};
use crate::clock::Clock;
use crate::cluster::{ClusterStateDigest, ClusterTopology, Token, TokenRangeSet};
use crate::coordination::store::keys;
use crate::coordination::CoordinatorStore;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Repair coordinator configuration
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Keyspace to repair
    pub keyspace: String,
    /// Abort when progress stands still for longer than this
    pub hang_timeout: Duration,
    /// Progress sampling period of the hang monitor
    pub monitor_interval: Duration,
    /// Capacity of the notification channel
    pub notification_capacity: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            keyspace: "system".to_string(),
            hang_timeout: Duration::from_secs(90 * 60),
            monitor_interval: Duration::from_secs(60),
            notification_capacity: 128,
        }
    }
}

/// Persisted resume point of an interrupted run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairCheckpoint {
    pub keyspace: String,
    /// End token of the last fully repaired range
    pub last_token: Option<Token>,
    pub cluster_digest: ClusterStateDigest,
    pub updated_at: DateTime<Utc>,
}

/// Result of a repair run that got past setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Success,
    Failed,
    Aborted,
}

impl RepairOutcome {
    fn phase(self) -> RepairPhase {
        match self {
            RepairOutcome::Success => RepairPhase::Success,
            RepairOutcome::Failed => RepairPhase::Failed,
            RepairOutcome::Aborted => RepairPhase::Aborted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairOutcome::Success => "success",
            RepairOutcome::Failed => "failed",
            RepairOutcome::Aborted => "aborted",
        }
    }
}

/// Repairs the local primary ranges of one keyspace
pub struct RepairCoordinator {
    config: RepairConfig,
    topology: Arc<dyn ClusterTopology>,
    facility: Arc<dyn RepairFacility>,
    store: Arc<CoordinatorStore>,
    clock: Arc<dyn Clock>,
    shared: Arc<RepairShared>,
    sender: NotificationSender,
    receiver: Mutex<mpsc::Receiver<RepairNotification>>,
}

impl RepairCoordinator {
    pub fn new(
        config: RepairConfig,
        topology: Arc<dyn ClusterTopology>,
        facility: Arc<dyn RepairFacility>,
        store: Arc<CoordinatorStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.notification_capacity.max(1));
        Self {
            config,
            topology,
            facility,
            store,
            clock,
            shared: Arc::new(RepairShared::new()),
            sender: NotificationSender::new(tx),
            receiver: Mutex::new(rx),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.config.keyspace
    }

    /// Handle through which the facility reports repair progress.
    pub fn notification_sender(&self) -> NotificationSender {
        self.sender.clone()
    }

    pub fn progress(&self) -> i32 {
        self.shared.progress()
    }

    pub fn phase(&self) -> RepairPhase {
        self.shared.phase()
    }

    pub fn snapshot(&self) -> RepairRunState {
        self.shared.snapshot()
    }

    /// The persisted resume point, if a previous run was interrupted.
    pub async fn checkpoint(&self) -> Result<Option<RepairCheckpoint>> {
        self.store
            .load(&keys::repair_checkpoint(&self.config.keyspace))
            .await
    }

    /// Repair every local primary range not yet covered by the checkpoint.
    ///
    /// Setup problems are returned as errors; a run that started reports its
    /// end through the outcome.
    pub async fn run(&self) -> Result<RepairOutcome> {
        let keyspace = self.config.keyspace.as_str();
        let mut notifications = self
            .receiver
            .try_lock()
            .map_err(|_| Error::AlreadyRunning(format!("repair of {}", keyspace)))?;

        let ranges = TokenRangeSet::local(self.topology.as_ref(), keyspace).await?;
        let digest = self.topology.cluster_state_digest().await?;
        let resume_token = match self.checkpoint().await? {
            Some(cp) if cp.cluster_digest == digest => cp.last_token,
            Some(cp) => {
                info!(
                    "Cluster state changed since checkpoint ({} -> {}), repairing {} from the first range",
                    cp.cluster_digest, digest, keyspace
                );
                None
            }
            None => None,
        };
        let start_index = ranges.resume_index(resume_token.as_ref());
        let last_token = if start_index == 0 { None } else { resume_token };

        // Leftovers from a previous run refer to commands that are gone
        while notifications.try_recv().is_ok() {}

        let started = Instant::now();
        self.shared
            .begin(ranges.len(), start_index, last_token, self.clock.now());
        info!(
            "Repair of {} started: {} primary ranges, resuming at #{}",
            keyspace,
            ranges.len(),
            start_index
        );

        let monitor = HangMonitor::spawn(
            self.shared.clone(),
            self.facility.clone(),
            self.config.monitor_interval,
            self.config.hang_timeout,
        );
        let mut outcome = self
            .repair_ranges(&ranges, start_index, &digest, &mut notifications)
            .await;
        monitor.stop().await;

        if self.shared.is_aborted() {
            outcome = RepairOutcome::Aborted;
        }
        if outcome == RepairOutcome::Success {
            if let Err(e) = self
                .store
                .delete(&keys::repair_checkpoint(keyspace))
                .await
            {
                warn!("Failed to clear repair checkpoint of {}: {}", keyspace, e);
            }
        }
        self.shared.finish(outcome.phase());

        counter!(
            "custodian_repair_runs_total",
            "service" => crate::telemetry::service(),
            "result" => outcome.as_str()
        )
        .increment(1);
        histogram!(
            "custodian_repair_duration_seconds",
            "service" => crate::telemetry::service()
        )
        .record(started.elapsed().as_secs_f64());
        info!(
            "Repair of {} ended {} after {}",
            keyspace,
            outcome.as_str(),
            format_duration(started.elapsed())
        );

        Ok(outcome)
    }

    async fn repair_ranges(
        &self,
        ranges: &TokenRangeSet,
        start_index: usize,
        digest: &ClusterStateDigest,
        notifications: &mut mpsc::Receiver<RepairNotification>,
    ) -> RepairOutcome {
        let keyspace = self.config.keyspace.as_str();
        let session = RepairSession::new(self.facility.as_ref(), &self.shared, keyspace);

        for range in ranges.iter().skip(start_index) {
            match self.topology.cluster_state_digest().await {
                Ok(current) if current == *digest => {}
                Ok(current) => {
                    error!(
                        "Cluster state changed during repair ({} -> {}), stopping",
                        digest, current
                    );
                    self.shared.mark_failed();
                    return RepairOutcome::Failed;
                }
                Err(e) => {
                    error!("Cannot read cluster state during repair: {}", e);
                    self.shared.mark_failed();
                    return RepairOutcome::Failed;
                }
            }

            match session.run(range, notifications).await {
                outcome if outcome.is_done() => {
                    let (completed, total) = self.shared.complete_range(range.end);
                    self.save_checkpoint(range.end, digest).await;
                    info!(
                        "Repaired range {} of {} ({}/{})",
                        range, keyspace, completed, total
                    );
                }
                SessionOutcome::Aborted => return RepairOutcome::Aborted,
                _ => {
                    error!("Repair of range {} failed, stopping", range);
                    return RepairOutcome::Failed;
                }
            }
        }

        RepairOutcome::Success
    }

    async fn save_checkpoint(&self, last_token: Token, digest: &ClusterStateDigest) {
        let checkpoint = RepairCheckpoint {
            keyspace: self.config.keyspace.clone(),
            last_token: Some(last_token),
            cluster_digest: digest.clone(),
            updated_at: self.clock.now(),
        };
        if let Err(e) = self
            .store
            .save(&keys::repair_checkpoint(&self.config.keyspace), &checkpoint)
            .await
        {
            warn!("Failed to persist repair checkpoint at {}: {}", last_token, e);
        }
    }
}

/// Minutes above five minutes, seconds otherwise.
fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs > 5 * 60 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42 seconds");
        assert_eq!(format_duration(Duration::from_secs(300)), "300 seconds");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 59)), "180 minutes");
    }
}
