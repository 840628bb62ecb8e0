//! Named, expiring cluster leases
//!
//! A lease document records its holder, a per-acquisition token and an expiry
//! time. Acquisition succeeds when the document is absent or expired; renewal
//! and release are only honoured for the token that acquired it.

use super::store::{keys, CoordinatorStore, BASE_BACKOFF_MS, MAX_CAS_RETRIES};
use crate::clock::Clock;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a busy lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Persisted lease document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("lease ttl {:?} out of range: {}", ttl, e)))
}

/// Acquires, renews and releases leases in the coordination store
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<CoordinatorStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(store: Arc<CoordinatorStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current active holder of a lease, if any
    pub async fn holder(&self, name: &str) -> Result<Option<LeaseRecord>> {
        let record: Option<LeaseRecord> = self.store.load(&keys::lease(name)).await?;
        let now = self.clock.now();
        Ok(record.filter(|r| r.is_active(now)))
    }

    /// Try once to take the lease. `Ok(None)` means someone else holds it.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>> {
        let key = keys::lease(name);
        let ttl_chrono = chrono_ttl(ttl)?;

        for retry in 0..MAX_CAS_RETRIES {
            let (current, etag) = self.store.load_with_etag::<LeaseRecord>(&key).await?;
            let now = self.clock.now();

            if let Some(existing) = current.as_ref().filter(|r| r.is_active(now)) {
                debug!(
                    "Lease {} held by {} until {}",
                    name, existing.holder_id, existing.expires_at
                );
                return Ok(None);
            }

            let record = LeaseRecord {
                holder_id: holder_id.to_string(),
                token: uuid::Uuid::new_v4().to_string(),
                acquired_at: now,
                expires_at: now + ttl_chrono,
            };

            match self.store.save_with_cas(&key, &record, &etag).await {
                Ok(()) => {
                    counter!(
                        "custodian_lease_operations_total",
                        "service" => crate::telemetry::service(),
                        "operation" => "acquire",
                        "result" => "ok"
                    )
                    .increment(1);
                    info!("{} acquired lease {} after {} retries", holder_id, name, retry);
                    return Ok(Some(LeaseGuard::start(
                        self.clone(),
                        name.to_string(),
                        record.token,
                        ttl,
                    )));
                }
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(retry);
                    debug!("Lease {} acquire conflict, retrying after {}ms", name, backoff_ms);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooManyRetries)
    }

    /// Wait up to `wait` for the lease.
    pub async fn lock(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LeaseGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(name, holder_id, ttl).await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                counter!(
                    "custodian_lease_operations_total",
                    "service" => crate::telemetry::service(),
                    "operation" => "acquire",
                    "result" => "timeout"
                )
                .increment(1);
                return Err(Error::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(wait)).await;
        }
    }

    /// Extend a lease held under `token`.
    pub async fn renew(&self, name: &str, token: &str, ttl: Duration) -> Result<()> {
        let key = keys::lease(name);
        let ttl_chrono = chrono_ttl(ttl)?;

        for retry in 0..MAX_CAS_RETRIES {
            let (current, etag) = self.store.load_with_etag::<LeaseRecord>(&key).await?;
            let mut record = match current {
                Some(r) if r.token == token => r,
                _ => return Err(Error::LeaseLost(name.to_string())),
            };
            record.expires_at = self.clock.now() + ttl_chrono;

            match self.store.save_with_cas(&key, &record, &etag).await {
                Ok(()) => return Ok(()),
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(retry);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooManyRetries)
    }

    /// Give the lease up by expiring it immediately.
    ///
    /// Releasing a lease that was already taken over is a no-op.
    pub async fn release(&self, name: &str, token: &str) -> Result<()> {
        let key = keys::lease(name);

        for retry in 0..MAX_CAS_RETRIES {
            let (current, etag) = self.store.load_with_etag::<LeaseRecord>(&key).await?;
            let mut record = match current {
                Some(r) if r.token == token => r,
                _ => {
                    debug!("Lease {} no longer ours, nothing to release", name);
                    return Ok(());
                }
            };
            record.expires_at = self.clock.now();

            match self.store.save_with_cas(&key, &record, &etag).await {
                Ok(()) => {
                    counter!(
                        "custodian_lease_operations_total",
                        "service" => crate::telemetry::service(),
                        "operation" => "release",
                        "result" => "ok"
                    )
                    .increment(1);
                    info!("Released lease {}", name);
                    return Ok(());
                }
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(retry);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooManyRetries)
    }
}

/// A held lease, renewed in the background until released or dropped.
///
/// Dropping the guard stops renewal; the lease then lapses after its TTL.
pub struct LeaseGuard {
    manager: LeaseManager,
    name: String,
    token: String,
    lost: CancellationToken,
    stop: CancellationToken,
    keeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl LeaseGuard {
    fn start(manager: LeaseManager, name: String, token: String, ttl: Duration) -> Self {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let keeper = {
            let manager = manager.clone();
            let name = name.clone();
            let token = token.clone();
            let lost = lost.clone();
            let stop = stop.clone();
            let period = (ttl / 3).max(Duration::from_millis(10));
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                let mut last_renewed = tokio::time::Instant::now();
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match manager.renew(&name, &token, ttl).await {
                                Ok(()) => last_renewed = tokio::time::Instant::now(),
                                Err(Error::LeaseLost(_)) => {
                                    warn!("Lease {} was taken over", name);
                                    lost.cancel();
                                    break;
                                }
                                Err(e) => {
                                    warn!("Failed to renew lease {}: {}", name, e);
                                    // Unrenewed past its TTL: someone else may hold it now
                                    if last_renewed.elapsed() >= ttl {
                                        lost.cancel();
                                        break;
                                    }
                                }
                            }
                        }
                        _ = stop.cancelled() => break,
                    }
                }
            })
        };

        Self {
            manager,
            name,
            token,
            lost,
            stop,
            keeper: Some(keeper),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Cancelled when the lease is observed to belong to someone else.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing and expire the lease.
    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(keeper) = self.keeper.take() {
            let _ = keeper.await;
        }
        if self.is_lost() {
            return Ok(());
        }
        self.manager.release(&self.name, &self.token).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn manager() -> (LeaseManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(CoordinatorStore::in_memory());
        (LeaseManager::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let (leases, _clock) = manager();
        let ttl = Duration::from_secs(30);

        let guard = leases.try_acquire("db-repair", "node1", ttl).await.unwrap();
        assert!(guard.is_some());
        assert!(leases.try_acquire("db-repair", "node2", ttl).await.unwrap().is_none());

        let holder = leases.holder("db-repair").await.unwrap().unwrap();
        assert_eq!(holder.holder_id, "node1");
    }

    #[tokio::test]
    async fn test_released_lease_can_be_taken() {
        let (leases, _clock) = manager();
        let ttl = Duration::from_secs(30);

        let guard = leases.try_acquire("cfg", "node1", ttl).await.unwrap().unwrap();
        guard.release().await.unwrap();

        let next = leases.try_acquire("cfg", "node2", ttl).await.unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_and_renew_fails() {
        let (leases, clock) = manager();
        let ttl = Duration::from_secs(30);

        let first = leases.try_acquire("cfg", "node1", ttl).await.unwrap().unwrap();
        let first_token = first.token().to_string();
        drop(first);

        clock.advance(Duration::from_secs(31));
        let second = leases.try_acquire("cfg", "node2", ttl).await.unwrap();
        assert!(second.is_some());

        let err = leases.renew("cfg", &first_token, ttl).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_lock_times_out() {
        let (leases, _clock) = manager();
        let ttl = Duration::from_secs(30);

        let _held = leases.try_acquire("cfg", "node1", ttl).await.unwrap().unwrap();
        let err = leases
            .lock("cfg", "node2", ttl, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }
}
