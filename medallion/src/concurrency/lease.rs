//! Exclusive, expiring leases scoped to a stage and a partition or entity.
//!
//! Every piece of mutable pipeline state (a load cursor, the loaded set, a merge watermark, the
//! current dimension versions, a fact table) is only mutated while holding the lease of its
//! owning stage. Leases expire after a TTL so a crashed holder cannot block progress forever.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use medallion_config::shared::LeaseConfig;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};

/// Stage owning a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseStage {
    Consumer,
    Bronze,
    Merge,
    Snapshot,
    Fact,
}

impl LeaseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStage::Consumer => "consumer",
            LeaseStage::Bronze => "bronze",
            LeaseStage::Merge => "merge",
            LeaseStage::Snapshot => "snapshot",
            LeaseStage::Fact => "fact",
        }
    }
}

/// Key under which a lease is held, e.g. `(Snapshot, "customer")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseScope {
    pub stage: LeaseStage,
    pub key: String,
}

impl LeaseScope {
    pub fn new(stage: LeaseStage, key: impl Into<String>) -> Self {
        Self {
            stage,
            key: key.into(),
        }
    }
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage.as_str(), self.key)
    }
}

/// Storage of lease ownership.
pub trait LeaseStore {
    /// Takes the lease for `holder` if it is free, expired, or already held by `holder`, and
    /// extends its expiry to `ttl` from now.
    ///
    /// Returns `false` when another holder owns an unexpired lease.
    fn try_acquire(
        &self,
        scope: &LeaseScope,
        holder: &str,
        ttl: Duration,
    ) -> impl Future<Output = EtlResult<bool>> + Send;

    /// Releases the lease if it is held by `holder`. Releasing a lease that is not held is a
    /// no-op.
    fn release(
        &self,
        scope: &LeaseScope,
        holder: &str,
    ) -> impl Future<Output = EtlResult<()>> + Send;
}

/// Acquires leases with polling and backoff until the configured acquisition timeout.
#[derive(Debug, Clone)]
pub struct LeaseManager<L> {
    store: L,
    config: LeaseConfig,
}

impl<L> LeaseManager<L>
where
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: L, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    /// Acquires the lease for `scope`, waiting while another holder owns it.
    ///
    /// Fails with [`ErrorKind::LeaseUnavailable`] once the acquisition timeout elapses.
    pub async fn acquire(&self, scope: LeaseScope) -> EtlResult<LeaseGuard<L>> {
        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut delay = Duration::from_millis(10);

        loop {
            if self
                .store
                .try_acquire(&scope, &holder, self.config.ttl())
                .await?
            {
                debug!(%scope, %holder, "lease acquired");

                return Ok(LeaseGuard {
                    store: self.store.clone(),
                    scope,
                    holder,
                    ttl: self.config.ttl(),
                    released: false,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.acquire_timeout() {
                bail!(
                    ErrorKind::LeaseUnavailable,
                    "Lease is held by another operation",
                    format!(
                        "Could not acquire `{scope}` within {:?}",
                        self.config.acquire_timeout()
                    )
                );
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            let jitter = Duration::from_millis(jitter_ms);
            let remaining = self.config.acquire_timeout() - elapsed;
            tokio::time::sleep((delay + jitter).min(remaining)).await;
            delay = (delay * 2).min(Duration::from_secs(1));
        }
    }
}

/// A held lease. Released explicitly with [`LeaseGuard::release`], or best-effort in the
/// background when dropped.
#[derive(Debug)]
pub struct LeaseGuard<L>
where
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    store: L,
    scope: LeaseScope,
    holder: String,
    ttl: Duration,
    released: bool,
}

impl<L> LeaseGuard<L>
where
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    pub fn scope(&self) -> &LeaseScope {
        &self.scope
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extends the lease. Fails with [`ErrorKind::LeaseUnavailable`] if it was lost, which
    /// happens when it expired and another holder took it over.
    pub async fn renew(&self) -> EtlResult<()> {
        if !self
            .store
            .try_acquire(&self.scope, &self.holder, self.ttl)
            .await?
        {
            bail!(
                ErrorKind::LeaseUnavailable,
                "Lease was lost",
                format!("`{}` expired and is now held by another operation", self.scope)
            );
        }

        Ok(())
    }

    pub async fn release(mut self) -> EtlResult<()> {
        self.released = true;
        self.store.release(&self.scope, &self.holder).await?;
        debug!(scope = %self.scope, "lease released");

        Ok(())
    }
}

impl<L> Drop for LeaseGuard<L>
where
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Without a runtime the lease simply expires after its TTL.
        let Ok(handle) = Handle::try_current() else {
            info!(scope = %self.scope, "no runtime available, lease will expire on its own");
            return;
        };

        let store = self.store.clone();
        let scope = self.scope.clone();
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            if let Err(err) = store.release(&scope, &holder).await {
                warn!(%scope, error = ?err.kind(), "failed to release lease on drop");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLeaseStore;

    fn config(acquire_timeout_ms: u64) -> LeaseConfig {
        LeaseConfig {
            ttl_ms: 60_000,
            acquire_timeout_ms,
        }
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let manager = LeaseManager::new(MemoryLeaseStore::default(), config(2_000));
        let scope = LeaseScope::new(LeaseStage::Snapshot, "customer");

        let guard = manager.acquire(scope.clone()).await.unwrap();

        let contender = {
            let manager = manager.clone();
            let scope = scope.clone();
            tokio::spawn(async move { manager.acquire(scope).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        guard.release().await.unwrap();
        let second = contender.await.unwrap().unwrap();
        assert_eq!(second.scope(), &scope);
    }

    #[tokio::test]
    async fn acquire_times_out_when_held() {
        let manager = LeaseManager::new(MemoryLeaseStore::default(), config(50));
        let scope = LeaseScope::new(LeaseStage::Merge, "orders");

        let _guard = manager.acquire(scope.clone()).await.unwrap();
        let err = manager.acquire(scope).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);
    }

    #[tokio::test]
    async fn different_scopes_do_not_conflict() {
        let manager = LeaseManager::new(MemoryLeaseStore::default(), config(10));

        let _a = manager
            .acquire(LeaseScope::new(LeaseStage::Merge, "orders"))
            .await
            .unwrap();
        let _b = manager
            .acquire(LeaseScope::new(LeaseStage::Snapshot, "orders"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let manager = LeaseManager::new(MemoryLeaseStore::default(), config(2_000));
        let scope = LeaseScope::new(LeaseStage::Fact, "sales");

        drop(manager.acquire(scope.clone()).await.unwrap());

        let reacquired = manager.acquire(scope).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_renew_fails() {
        let store = MemoryLeaseStore::default();
        let short = LeaseManager::new(
            store.clone(),
            LeaseConfig {
                ttl_ms: 10,
                acquire_timeout_ms: 10,
            },
        );
        let scope = LeaseScope::new(LeaseStage::Consumer, "p1");

        let stale = short.acquire(scope.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = LeaseManager::new(store, config(10))
            .acquire(scope)
            .await
            .unwrap();

        let err = stale.renew().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);
        fresh.renew().await.unwrap();
    }
}
