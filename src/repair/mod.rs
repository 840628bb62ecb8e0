//! Node-local repair of primary token ranges
//!
//! The data store repairs one range per asynchronous command and reports back
//! through notifications. A [`RepairCoordinator`] drives the ranges of the
//! local node one at a time, a [`HangMonitor`] aborts a run that stops making
//! progress, and a checkpoint lets an interrupted run resume.

pub mod coordinator;
pub mod monitor;
pub mod service;
pub mod session;
pub mod state;

pub use coordinator::{RepairCheckpoint, RepairConfig, RepairCoordinator, RepairOutcome};
pub use monitor::HangMonitor;
pub use service::{RepairService, RepairServiceConfig};
pub use session::{RepairSession, SessionOutcome};
pub use state::{RepairPhase, RepairRunState, RepairShared};

use crate::cluster::TokenRange;
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Status carried in the second slot of a repair notification's user data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    Started,
    SessionSuccess,
    SessionFailed,
    Finished,
}

impl RepairStatus {
    pub fn code(self) -> i32 {
        match self {
            RepairStatus::Started => 0,
            RepairStatus::SessionSuccess => 1,
            RepairStatus::SessionFailed => 2,
            RepairStatus::Finished => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RepairStatus::Started),
            1 => Some(RepairStatus::SessionSuccess),
            2 => Some(RepairStatus::SessionFailed),
            3 => Some(RepairStatus::Finished),
            _ => None,
        }
    }
}

/// Kind of notification received from the data store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Repair progress; user data is `[command, status]`
    Repair,
    /// The notification stream dropped messages
    NotificationsLost,
    ConnectionFailed,
    ConnectionClosed,
    Other(String),
}

/// A notification emitted by the repair facility
#[derive(Debug, Clone)]
pub struct RepairNotification {
    pub kind: NotificationKind,
    pub user_data: Vec<i32>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RepairNotification {
    pub fn new(kind: NotificationKind, user_data: Vec<i32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            user_data,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn repair(command: i32, status: RepairStatus, message: impl Into<String>) -> Self {
        Self::new(
            NotificationKind::Repair,
            vec![command, status.code()],
            message,
        )
    }

    pub fn notifications_lost(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::NotificationsLost, Vec::new(), message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::ConnectionFailed, Vec::new(), message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::ConnectionClosed, Vec::new(), message)
    }
}

/// Delivers notifications from the facility to the coordinator.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<RepairNotification>,
}

impl NotificationSender {
    pub(crate) fn new(tx: mpsc::Sender<RepairNotification>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, notification: RepairNotification) -> Result<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| Error::Repair("repair coordinator is gone".to_string()))
    }

    /// Send without waiting; fails when the channel is full.
    pub fn try_send(&self, notification: RepairNotification) -> Result<()> {
        self.tx
            .try_send(notification)
            .map_err(|e| Error::Repair(format!("cannot deliver repair notification: {}", e)))
    }
}

/// The data store's repair service
#[async_trait]
pub trait RepairFacility: Send + Sync {
    /// Start repairing `range`; returns the command id, `<= 0` when there is
    /// nothing to repair.
    async fn force_repair_range_async(&self, range: &TokenRange, keyspace: &str) -> Result<i32>;

    /// Kill every running repair session on this node.
    async fn force_terminate_all_repair_sessions(&self) -> Result<()>;
}
