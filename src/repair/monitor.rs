//! Stall detection for a running repair
//!
//! The monitor samples progress at a fixed rate. If the value has not changed
//! for longer than the timeout, every repair session on the node is killed
//! (once) and the run is aborted.

use super::{RepairFacility, RepairShared};

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Tracks how long progress has stood still
#[derive(Debug)]
pub struct HangMonitor {
    timeout: Duration,
    last_progress: Option<i32>,
    last_change: Instant,
}

impl HangMonitor {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_progress: None,
            last_change: now,
        }
    }

    /// Record a progress sample; returns true when the run is considered hung.
    pub fn observe(&mut self, progress: i32, now: Instant) -> bool {
        if self.last_progress != Some(progress) {
            self.last_progress = Some(progress);
            self.last_change = now;
            return false;
        }
        now.duration_since(self.last_change) > self.timeout
    }

    /// Start sampling `shared` every `period` until stopped or a hang fires.
    pub fn spawn(
        shared: Arc<RepairShared>,
        facility: Arc<dyn RepairFacility>,
        period: Duration,
        timeout: Duration,
    ) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut monitor = HangMonitor::new(timeout, start);
            monitor.observe(shared.progress(), start);

            let mut ticker = tokio::time::interval_at(start + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = ticker.tick() => {
                        let progress = shared.progress();
                        if !monitor.observe(progress, Instant::now()) {
                            debug!("Repair progress {}%", progress);
                            continue;
                        }

                        error!(
                            "Repair made no progress past {}% for more than {:?}, terminating all repair sessions",
                            progress, timeout
                        );
                        if let Err(e) = facility.force_terminate_all_repair_sessions().await {
                            error!("Failed to terminate repair sessions: {}", e);
                        }
                        shared.abort();
                        counter!(
                            "custodian_repair_hangs_total",
                            "service" => crate::telemetry::service()
                        )
                        .increment(1);
                        return true;
                    }
                }
            }
        });

        MonitorHandle { cancel, handle }
    }
}

/// A running hang monitor
pub struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<bool>,
}

impl MonitorHandle {
    /// Stop the monitor. Returns whether it detected a hang.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        self.handle.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_progress_resets_timer() {
        let start = Instant::now();
        let timeout = Duration::from_secs(90 * 60);
        let mut monitor = HangMonitor::new(timeout, start);

        assert!(!monitor.observe(10, start));
        assert!(!monitor.observe(10, start + Duration::from_secs(60 * 60)));
        assert!(!monitor.observe(20, start + Duration::from_secs(89 * 60)));
        // 90 minutes after the last change, not yet more than the timeout
        assert!(!monitor.observe(20, start + Duration::from_secs(179 * 60)));
        assert!(monitor.observe(20, start + Duration::from_secs(180 * 60)));
    }

    #[test]
    fn test_first_sample_never_hangs() {
        let start = Instant::now();
        let mut monitor = HangMonitor::new(Duration::from_secs(1), start);
        assert!(!monitor.observe(-1, start + Duration::from_secs(3600)));
    }
}
