//! Shared repair run state
//!
//! All fields are read and written under one mutex. The driving loop is the
//! only writer of `completed_ranges` and `last_token`; the notification
//! handler and the hang monitor only touch `success` and `aborted`.

use super::{NotificationKind, RepairNotification, RepairStatus};
use crate::cluster::Token;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Lifecycle of a repair run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepairPhase {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Aborted,
}

/// Snapshot of a repair run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRunState {
    pub total_ranges: usize,
    pub completed_ranges: usize,
    pub last_token: Option<Token>,
    pub start_time: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub success: bool,
    pub phase: RepairPhase,
}

impl RepairRunState {
    /// Percentage of ranges done, `-1` while no ranges are known.
    pub fn progress(&self) -> i32 {
        if self.total_ranges == 0 {
            -1
        } else {
            (self.completed_ranges * 100 / self.total_ranges) as i32
        }
    }
}

/// Run state plus the wake-up signal for the waiting session
#[derive(Default)]
pub struct RepairShared {
    state: Mutex<RepairRunState>,
    wake: Notify,
}

impl RepairShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RepairRunState {
        self.state.lock().clone()
    }

    pub fn progress(&self) -> i32 {
        self.state.lock().progress()
    }

    pub fn phase(&self) -> RepairPhase {
        self.state.lock().phase
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_success(&self) -> bool {
        self.state.lock().success
    }

    /// Reset for a new run resuming after `completed` ranges.
    pub fn begin(
        &self,
        total: usize,
        completed: usize,
        last_token: Option<Token>,
        start_time: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        *state = RepairRunState {
            total_ranges: total,
            completed_ranges: completed,
            last_token,
            start_time: Some(start_time),
            aborted: false,
            success: true,
            phase: RepairPhase::Running,
        };
    }

    /// Record a fully repaired range. Returns `(completed, total)`.
    pub fn complete_range(&self, end: Token) -> (usize, usize) {
        let mut state = self.state.lock();
        state.completed_ranges += 1;
        state.last_token = Some(end);
        (state.completed_ranges, state.total_ranges)
    }

    pub fn mark_failed(&self) {
        self.state.lock().success = false;
    }

    /// Abort the run and wake the waiting session.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.aborted = true;
            state.success = false;
        }
        self.wake.notify_one();
    }

    /// Close the run in its terminal phase.
    pub fn finish(&self, phase: RepairPhase) {
        let mut state = self.state.lock();
        state.phase = phase;
        if phase == RepairPhase::Success {
            state.last_token = None;
        }
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    /// The notification channel closed under the waiting session.
    pub fn connection_lost(&self) {
        error!("Repair notification channel closed, repair is treated as failed");
        self.state.lock().success = false;
    }

    /// Apply a notification; returns true when the command `current` is done.
    pub fn handle_notification(&self, notification: &RepairNotification, current: i32) -> bool {
        let mut state = self.state.lock();

        match &notification.kind {
            NotificationKind::Repair => {
                if notification.user_data.len() != 2 {
                    error!(
                        "Unexpected repair notification user data {:?}: {}",
                        notification.user_data, notification.message
                    );
                    return false;
                }
                let (command, code) = (notification.user_data[0], notification.user_data[1]);
                if command != current {
                    debug!(
                        "Ignoring notification for command {} while waiting for {}",
                        command, current
                    );
                    return false;
                }

                match RepairStatus::from_code(code) {
                    Some(RepairStatus::SessionFailed) => {
                        error!("Repair session failed: {}", notification.message);
                        state.success = false;
                        true
                    }
                    Some(RepairStatus::Finished) => {
                        if state.aborted {
                            state.success = false;
                        }
                        info!("Repair command {} finished: {}", command, notification.message);
                        true
                    }
                    Some(RepairStatus::SessionSuccess) if state.aborted => {
                        state.success = false;
                        true
                    }
                    _ => {
                        debug!("Repair command {}: {}", command, notification.message);
                        false
                    }
                }
            }
            NotificationKind::NotificationsLost => {
                warn!("Repair notifications lost: {}", notification.message);
                false
            }
            NotificationKind::ConnectionFailed | NotificationKind::ConnectionClosed => {
                error!(
                    "Connection to repair service lost ({:?}): {}",
                    notification.kind, notification.message
                );
                state.success = false;
                true
            }
            NotificationKind::Other(kind) => {
                debug!("Ignoring {} notification: {}", kind, notification.message);
                false
            }
        }
    }
}
