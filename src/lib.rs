//! # Custodian
//!
//! Cluster maintenance for a replicated database: token-range repair and
//! scheduled backups with resumable uploads.
//!
//! ## Key Features
//!
//! - **Resumable repair**: Each node repairs its primary token ranges in ring
//!   order and checkpoints after every range, so an interrupted run resumes
//!   where it stopped unless the topology changed in between
//! - **Hang detection**: A monitor terminates repair sessions that make no
//!   progress for too long
//! - **Leader-only scheduling**: One node, elected through a lease in the
//!   coordination store, creates, uploads and reclaims scheduled backups
//! - **Idempotent uploads**: Archives are streamed deterministically, so
//!   interrupted uploads resume at the remote file's size and uploaded backups
//!   are never sent twice
//!
//! ## Architecture
//!
//! - **Coordination**: JSON documents with compare-and-swap writes on object
//!   storage, leases and leader election on top
//! - **Repair**: `RepairCoordinator` drives ranges through a `RepairFacility`
//! - **Backup**: `BackupScheduler` runs `BackupExecutor` and `UploadExecutor`

pub mod backup;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod repair;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::backup::{
        BackupContext, BackupExecutor, BackupScheduler, BackupSettings, ScheduleCalculator,
        ScheduleInterval, UploadExecutor, UploadPolicy,
    };
    pub use crate::clock::{BoundedClock, Clock};
    pub use crate::cluster::{ClusterTopology, StaticTopology, TokenRange, TokenRangeSet};
    pub use crate::coordination::{CoordinatorStore, LeaderElector, LeaseManager};
    pub use crate::repair::{RepairConfig, RepairCoordinator, RepairFacility, RepairOutcome};
    pub use crate::{Error, Result};
}
