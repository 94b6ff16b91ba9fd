//! Per-user serialization of ledger and object-store mutations.
//!
//! An in-process mutex orders tasks of one service; a lease row in the ledger orders the
//! `watch` daemon against one-shot CLI runs that share the same database.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cidc_storage::{Ledger, UserId};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::AccessError;

const LEASE_POLL_START: Duration = Duration::from_millis(10);
const LEASE_POLL_MAX: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct LeaseConfig {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

/// One async mutex per user, optionally backed by a ledger lease. Operations on different
/// users run concurrently.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    lease: Option<LeaseConfig>,
    releases: Releases,
}

type Releases = Arc<StdMutex<Vec<JoinHandle<()>>>>;

struct HeldLease {
    ledger: Arc<dyn Ledger>,
    user_id: UserId,
    holder: String,
    releases: Releases,
}

/// Held for the duration of one user's ACL work. Dropping it releases the lease before the
/// in-process mutex, so the next local waiter never races the release.
pub struct UserGuard {
    local: Option<OwnedMutexGuard<()>>,
    lease: Option<HeldLease>,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let local = self.local.take();
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let HeldLease {
            ledger,
            user_id,
            holder,
            releases,
        } = lease;
        let task = handle.spawn(async move {
            if let Err(e) = ledger.release_user_lease(&user_id, &holder).await {
                warn!(user_id = %user_id, error = %e, "failed to release user lease; it will lapse");
            }
            drop(local);
        });
        if let Ok(mut pending) = releases.lock() {
            pending.retain(|t| !t.is_finished());
            pending.push(task);
        };
    }
}

impl UserLocks {
    /// In-process locking only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also take a ledger lease per user, held for at most `ttl`.
    pub fn with_lease(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            locks: Arc::default(),
            lease: Some(LeaseConfig { ledger, clock, ttl }),
            releases: Arc::default(),
        }
    }

    /// Wait for lease releases still running in the background. Call before the runtime
    /// shuts down, or the leases stay held until they lapse.
    pub async fn flush(&self) {
        let pending = match self.releases.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        for task in pending {
            let _ = task.await;
        }
    }

    pub async fn lock(&self, user_id: &UserId) -> Result<UserGuard, AccessError> {
        let mutex = self
            .locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let local = mutex.lock_owned().await;

        let Some(lease) = &self.lease else {
            return Ok(UserGuard {
                local: Some(local),
                lease: None,
            });
        };

        let holder = Uuid::now_v7().to_string();
        let ttl = chrono::Duration::from_std(lease.ttl).unwrap_or(chrono::Duration::minutes(2));
        // A lease left by a crashed holder lapses after `ttl`, so waiting slightly longer
        // than that always succeeds unless someone keeps taking it.
        let deadline = tokio::time::Instant::now() + lease.ttl + LEASE_POLL_MAX;
        let mut delay = LEASE_POLL_START;
        loop {
            let now = lease.clock.now();
            if lease
                .ledger
                .acquire_user_lease(user_id, &holder, now + ttl, now)
                .await?
            {
                return Ok(UserGuard {
                    local: Some(local),
                    lease: Some(HeldLease {
                        ledger: lease.ledger.clone(),
                        user_id: user_id.clone(),
                        holder,
                        releases: self.releases.clone(),
                    }),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AccessError::UserBusy(user_id.clone()));
            }
            debug!(user_id = %user_id, "user lease held elsewhere; waiting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(LEASE_POLL_MAX);
        }
    }

    /// Lock several users, always in id order so that two callers cannot deadlock.
    pub async fn lock_many(&self, user_ids: &[UserId]) -> Result<Vec<UserGuard>, AccessError> {
        let mut ids = user_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.lock(id).await?);
        }
        Ok(guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use cidc_storage::MockLedger;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_same_user_is_serialized() {
        let locks = UserLocks::new();
        let user = UserId(Uuid::now_v7());

        let guard = locks.lock(&user).await.unwrap();
        let locks2 = locks.clone();
        let user2 = user.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock(&user2).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_users_do_not_block() {
        let locks = UserLocks::new();
        let _a = locks.lock(&UserId(Uuid::now_v7())).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&UserId(Uuid::now_v7())),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_dedupes() {
        let locks = UserLocks::new();
        let user = UserId(Uuid::now_v7());
        let guards = locks.lock_many(&[user.clone(), user]).await.unwrap();
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_is_taken_and_released() {
        let user = UserId(Uuid::now_v7());
        let mut ledger = MockLedger::new();
        ledger
            .expect_acquire_user_lease()
            .times(1)
            .returning(|_, _, _, _| Ok(true));
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        ledger
            .expect_release_user_lease()
            .times(1)
            .returning(move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let locks = UserLocks::with_lease(Arc::new(ledger), clock, Duration::from_secs(60));
        let guard = locks.lock(&user).await.unwrap();
        drop(guard);
        locks.flush().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_busy_lease_times_out() {
        let user = UserId(Uuid::now_v7());
        let mut ledger = MockLedger::new();
        ledger
            .expect_acquire_user_lease()
            .returning(|_, _, _, _| Ok(false));

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let locks = UserLocks::with_lease(Arc::new(ledger), clock, Duration::from_millis(20));
        let err = locks.lock(&user).await.err().unwrap();
        assert!(matches!(err, AccessError::UserBusy(id) if id == user));
    }
}
