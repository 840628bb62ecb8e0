//! Repair of a single token range

use super::{RepairFacility, RepairNotification, RepairShared};
use crate::cluster::TokenRange;

use tokio::sync::mpsc;
use tracing::{error, info};

/// How one range repair ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The facility reported the range repaired
    Completed,
    /// The facility had nothing to repair
    Skipped,
    Failed,
    Aborted,
}

impl SessionOutcome {
    /// Whether the range counts as done.
    pub fn is_done(&self) -> bool {
        matches!(self, SessionOutcome::Completed | SessionOutcome::Skipped)
    }
}

/// Issues one asynchronous repair command and waits for its completion
pub struct RepairSession<'a> {
    facility: &'a dyn RepairFacility,
    shared: &'a RepairShared,
    keyspace: &'a str,
}

impl<'a> RepairSession<'a> {
    pub fn new(facility: &'a dyn RepairFacility, shared: &'a RepairShared, keyspace: &'a str) -> Self {
        Self {
            facility,
            shared,
            keyspace,
        }
    }

    /// Repair `range`, consuming notifications from `notifications` until the
    /// command completes, the run is aborted or the channel closes.
    pub async fn run(
        &self,
        range: &TokenRange,
        notifications: &mut mpsc::Receiver<RepairNotification>,
    ) -> SessionOutcome {
        if self.shared.is_aborted() {
            return SessionOutcome::Aborted;
        }

        let command = match self
            .facility
            .force_repair_range_async(range, self.keyspace)
            .await
        {
            Ok(command) => command,
            Err(e) => {
                error!("Failed to start repair of range {}: {}", range, e);
                self.shared.mark_failed();
                return SessionOutcome::Failed;
            }
        };

        if command <= 0 {
            info!("Nothing to repair for range {} of {}", range, self.keyspace);
            return SessionOutcome::Skipped;
        }
        info!("Repair of range {} started as command {}", range, command);

        loop {
            if self.shared.is_aborted() {
                break;
            }
            tokio::select! {
                _ = self.shared.wake().notified() => {}
                received = notifications.recv() => match received {
                    Some(notification) => {
                        if self.shared.handle_notification(&notification, command) {
                            break;
                        }
                    }
                    None => {
                        self.shared.connection_lost();
                        break;
                    }
                },
            }
        }

        if self.shared.is_aborted() {
            SessionOutcome::Aborted
        } else if self.shared.is_success() {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Failed
        }
    }
}
