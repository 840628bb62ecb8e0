//! Periodic repair, one node at a time
//!
//! Every node runs a [`RepairService`]. A cluster lease serialises the runs so
//! that no two nodes repair concurrently.

use super::coordinator::{RepairCoordinator, RepairOutcome};
use crate::coordination::LeaseManager;
use crate::{Error, Result};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Repair service configuration
#[derive(Debug, Clone)]
pub struct RepairServiceConfig {
    /// Time between repair attempts
    pub interval: Duration,
    /// Name of the cluster-wide repair lock
    pub lock_name: String,
    /// Lease TTL of the repair lock
    pub lock_ttl: Duration,
    /// How long to wait for another node's repair to finish
    pub lock_wait: Duration,
}

impl Default for RepairServiceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 3600),
            lock_name: "db-repair".to_string(),
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(10 * 60),
        }
    }
}

/// Runs the repair coordinator periodically under the cluster repair lock
pub struct RepairService {
    coordinator: Arc<RepairCoordinator>,
    leases: LeaseManager,
    node_id: String,
    config: RepairServiceConfig,
}

impl RepairService {
    pub fn new(
        coordinator: Arc<RepairCoordinator>,
        leases: LeaseManager,
        node_id: impl Into<String>,
        config: RepairServiceConfig,
    ) -> Self {
        Self {
            coordinator,
            leases,
            node_id: node_id.into(),
            config,
        }
    }

    /// Run one repair if the cluster lock can be taken in time.
    ///
    /// Returns `Ok(None)` when another node kept the lock.
    pub async fn run_once(&self) -> Result<Option<RepairOutcome>> {
        let guard = match self
            .leases
            .lock(
                &self.config.lock_name,
                &self.node_id,
                self.config.lock_ttl,
                self.config.lock_wait,
            )
            .await
        {
            Ok(guard) => guard,
            Err(Error::LockTimeout(name)) => {
                info!("Repair lock {} busy, skipping this cycle", name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let result = self.coordinator.run().await;
        if guard.is_lost() {
            warn!(
                "Repair lock {} was lost while repairing {}",
                self.config.lock_name,
                self.coordinator.keyspace()
            );
        }
        if let Err(e) = guard.release().await {
            warn!("Failed to release repair lock: {}", e);
        }

        result.map(Some)
    }

    /// Repair every `interval` until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(Some(outcome)) => info!("Repair cycle finished: {}", outcome.as_str()),
                        Ok(None) => {}
                        Err(e) => error!("Repair cycle failed: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Repair service shutting down gracefully");
                    break;
                }
            }
        }
    }
}
