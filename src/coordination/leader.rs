//! Lease-based leader election with automatic re-queue
//!
//! A node becomes leader by taking the election lease. While it holds the
//! lease the listener's leadership is active; when the lease is lost or the
//! node shuts down the listener is told to stop, and (unless shutting down)
//! the elector goes back to competing for the lease.

use super::lease::LeaseManager;

use async_trait::async_trait;
use metrics::gauge;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives leadership transitions.
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    /// Called once each time this node becomes leader.
    async fn start_leadership(&self);

    /// Called when leadership ends. Must not block.
    fn stop_leadership(&self);
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Name of the election lease
    pub election_name: String,
    /// Lease time-to-live; renewed every `ttl / 3`
    pub lease_ttl: Duration,
    /// Delay between acquisition attempts while not leader
    pub retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            election_name: "backup-scheduler".to_string(),
            lease_ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Competes for an exclusive cluster role
pub struct LeaderElector {
    leases: LeaseManager,
    node_id: String,
    config: LeaderConfig,
    listener: Arc<dyn LeadershipListener>,
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        leases: LeaseManager,
        node_id: impl Into<String>,
        config: LeaderConfig,
        listener: Arc<dyn LeadershipListener>,
    ) -> Self {
        Self {
            leases,
            node_id: node_id.into(),
            config,
            listener,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Spawn the election loop.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Compete for leadership until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let name = self.config.election_name.as_str();
        let mut interval = tokio::time::interval(self.config.retry_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let guard = match self
                .leases
                .try_acquire(name, &self.node_id, self.config.lease_ttl)
                .await
            {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!("{} is not leader of {}", self.node_id, name);
                    continue;
                }
                Err(e) => {
                    warn!("Leader election for {} failed: {}", name, e);
                    continue;
                }
            };

            self.set_leader(true);
            info!("{} became leader of {}", self.node_id, name);
            self.listener.start_leadership().await;

            let lost = guard.lost();
            tokio::select! {
                _ = lost.cancelled() => {
                    warn!("{} lost leadership of {}", self.node_id, name);
                }
                _ = shutdown.cancelled() => {}
            }

            self.set_leader(false);
            self.listener.stop_leadership();

            if shutdown.is_cancelled() {
                if let Err(e) = guard.release().await {
                    warn!("Failed to release leadership of {}: {}", name, e);
                }
                break;
            }
            drop(guard);
            info!("{} re-queued for leadership of {}", self.node_id, name);
        }

        info!("Leader elector for {} shutting down", name);
    }

    fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::Release);
        gauge!(
            "custodian_leader",
            "service" => crate::telemetry::service(),
            "election" => self.config.election_name.clone()
        )
        .set(if leader { 1.0 } else { 0.0 });
    }
}
