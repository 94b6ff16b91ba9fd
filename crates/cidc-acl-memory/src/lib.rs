//! In-memory bucket ACL using DashMap.
//!
//! This implementation is suitable for:
//! - Tests that need a store with scripted failures
//! - Dry runs of reconciliation without touching the real bucket
//!
//! Grants live only in this process.

use async_trait::async_trait;
use cidc_acl::{
    AclChange, AclError, AclOp, AclPrefix, BucketAcl, GrantListing, Principal, ReadGrant,
};
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

const DEFAULT_MAX_BATCH: usize = 100;

/// In-memory read grants keyed by principal, with fault injection.
pub struct MemoryBucket {
    grants: DashMap<Principal, BTreeSet<AclPrefix>>,
    listers: DashSet<Principal>,
    // Remaining scripted transient failures per prefix; u32::MAX never recovers.
    transient: DashMap<AclPrefix, u32>,
    missing: DashSet<AclPrefix>,
    denied: AtomicBool,
    listing_failures: AtomicU32,
    lister_failures: AtomicU32,
    calls: AtomicUsize,
    round_trips: AtomicUsize,
    max_batch: usize,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::with_max_batch(DEFAULT_MAX_BATCH)
    }

    pub fn with_max_batch(max_batch: usize) -> Self {
        Self {
            grants: DashMap::new(),
            listers: DashSet::new(),
            transient: DashMap::new(),
            missing: DashSet::new(),
            denied: AtomicBool::new(false),
            listing_failures: AtomicU32::new(0),
            lister_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            round_trips: AtomicUsize::new(0),
            max_batch,
        }
    }

    /// Fail the next `times` mutations of `prefix` with a transient error.
    pub fn fail_transient(&self, prefix: &AclPrefix, times: u32) {
        self.transient.insert(prefix.clone(), times);
    }

    /// Fail every mutation of `prefix` with a transient error until cleared.
    pub fn fail_always(&self, prefix: &AclPrefix) {
        self.transient.insert(prefix.clone(), u32::MAX);
    }

    /// Fail the next `times` listings with a transient error.
    pub fn fail_listing(&self, times: u32) {
        self.listing_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` lister role changes with a transient error.
    pub fn fail_lister(&self, times: u32) {
        self.lister_failures.store(times, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        self.transient.clear();
        self.listing_failures.store(0, Ordering::SeqCst);
        self.lister_failures.store(0, Ordering::SeqCst);
    }

    /// Reject every call as if the engine's credentials were revoked.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Report `prefix` as a nonexistent path.
    pub fn mark_missing(&self, prefix: &AclPrefix) {
        self.missing.insert(prefix.clone());
    }

    /// Insert a grant without going through the ACL API (out-of-band drift).
    pub fn insert_grant(&self, principal: &Principal, prefix: &AclPrefix) {
        self.grants
            .entry(principal.clone())
            .or_default()
            .insert(prefix.clone());
    }

    pub fn has_reader(&self, principal: &Principal, prefix: &AclPrefix) -> bool {
        self.grants
            .get(principal)
            .is_some_and(|set| set.contains(prefix))
    }

    /// Holds the bucket listing role. Not counted in [`MemoryBucket::calls`].
    pub fn is_lister(&self, principal: &Principal) -> bool {
        self.listers.contains(principal)
    }

    pub fn prefixes_of(&self, principal: &Principal) -> BTreeSet<AclPrefix> {
        self.grants
            .get(principal)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn readers_of(&self, prefix: &AclPrefix) -> BTreeSet<Principal> {
        self.grants
            .iter()
            .filter(|entry| entry.value().contains(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every non-empty grant set.
    pub fn snapshot(&self) -> BTreeMap<Principal, BTreeSet<AclPrefix>> {
        self.grants
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Mutation attempts, counting each change in a batch.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Store round-trips (a batch is one).
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.round_trips.store(0, Ordering::SeqCst);
    }

    fn check_faults(&self, prefix: &AclPrefix) -> Result<(), AclError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(AclError::PermissionDenied("access denied".to_string()));
        }
        if self.missing.contains(prefix) {
            return Err(AclError::ResourceNotFound(format!("no such path: {}", prefix)));
        }
        if let Some(mut remaining) = self.transient.get_mut(prefix) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(AclError::Transient(format!("simulated failure for {}", prefix)));
            }
        }
        Ok(())
    }

    fn mutate(&self, change: &AclChange) -> Result<(), AclError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_faults(&change.prefix)?;
        match change.op {
            AclOp::AddReader => {
                self.insert_grant(&change.principal, &change.prefix);
            }
            AclOp::RemoveReader => {
                if let Some(mut set) = self.grants.get_mut(&change.principal) {
                    set.remove(&change.prefix);
                }
            }
        }
        Ok(())
    }
}

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketAcl for MemoryBucket {
    async fn add_reader(&self, principal: &Principal, prefix: &AclPrefix) -> Result<(), AclError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.mutate(&AclChange::add(principal.clone(), prefix.clone()))
    }

    async fn remove_reader(
        &self,
        principal: &Principal,
        prefix: &AclPrefix,
    ) -> Result<(), AclError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.mutate(&AclChange::remove(principal.clone(), prefix.clone()))
    }

    async fn apply_batch(&self, changes: &[AclChange]) -> Vec<Result<(), AclError>> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        changes.iter().map(|c| self.mutate(c)).collect()
    }

    async fn list_grants(&self, principal: &Principal) -> Result<GrantListing, AclError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(AclError::PermissionDenied("access denied".to_string()));
        }
        if take_failure(&self.listing_failures) {
            return Err(AclError::Transient("simulated listing failure".to_string()));
        }
        Ok(GrantListing {
            reads: self
                .prefixes_of(principal)
                .into_iter()
                .map(ReadGrant::permanent)
                .collect(),
            lister: self.is_lister(principal),
        })
    }

    async fn set_lister(&self, principal: &Principal, enabled: bool) -> Result<(), AclError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(AclError::PermissionDenied("access denied".to_string()));
        }
        if take_failure(&self.lister_failures) {
            return Err(AclError::Transient("simulated lister failure".to_string()));
        }
        if enabled {
            self.listers.insert(principal.clone());
        } else {
            self.listers.remove(principal);
        }
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal::user("alice@example.com")
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let bucket = MemoryBucket::new();
        let prefix = AclPrefix::new("t1/wes");

        bucket.add_reader(&alice(), &prefix).await.unwrap();
        bucket.add_reader(&alice(), &prefix).await.unwrap();
        assert!(bucket.has_reader(&alice(), &prefix));
        assert_eq!(bucket.prefixes_of(&alice()).len(), 1);

        bucket.remove_reader(&alice(), &prefix).await.unwrap();
        bucket.remove_reader(&alice(), &prefix).await.unwrap();
        assert!(!bucket.has_reader(&alice(), &prefix));
        assert!(bucket.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_transient_failures_recover() {
        let bucket = MemoryBucket::new();
        let prefix = AclPrefix::new("t1/wes");
        bucket.fail_transient(&prefix, 2);

        assert!(bucket.add_reader(&alice(), &prefix).await.unwrap_err().is_transient());
        assert!(bucket.add_reader(&alice(), &prefix).await.is_err());
        bucket.add_reader(&alice(), &prefix).await.unwrap();
        assert_eq!(bucket.calls(), 3);
    }

    #[tokio::test]
    async fn test_batch_is_one_round_trip() {
        let bucket = MemoryBucket::new();
        let changes = vec![
            AclChange::add(alice(), AclPrefix::new("t1/wes")),
            AclChange::add(alice(), AclPrefix::new("t1/olink")),
        ];
        let results = bucket.apply_batch(&changes).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(bucket.round_trips(), 1);
        assert_eq!(bucket.calls(), 2);
    }

    #[tokio::test]
    async fn test_denied_and_missing() {
        let bucket = MemoryBucket::new();
        let prefix = AclPrefix::new("t1/wes");
        bucket.mark_missing(&prefix);
        assert!(matches!(
            bucket.add_reader(&alice(), &prefix).await,
            Err(AclError::ResourceNotFound(_))
        ));

        bucket.set_denied(true);
        assert!(matches!(
            bucket.list_prefixes(&alice()).await,
            Err(AclError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_failures() {
        let bucket = MemoryBucket::new();
        bucket.insert_grant(&alice(), &AclPrefix::new("t1/wes"));
        bucket.fail_listing(1);
        assert!(bucket.list_prefixes(&alice()).await.is_err());
        assert_eq!(bucket.list_prefixes(&alice()).await.unwrap().len(), 1);
        assert_eq!(
            bucket.readers_of(&AclPrefix::new("t1/wes")),
            BTreeSet::from([alice()])
        );
    }

    #[tokio::test]
    async fn test_lister_role_is_listed_and_not_counted_as_mutation() {
        let bucket = MemoryBucket::new();
        bucket.fail_lister(1);
        assert!(bucket.set_lister(&alice(), true).await.unwrap_err().is_transient());
        bucket.set_lister(&alice(), true).await.unwrap();
        assert!(bucket.is_lister(&alice()));
        assert!(bucket.list_grants(&alice()).await.unwrap().lister);
        assert_eq!(bucket.calls(), 0);

        bucket.set_lister(&alice(), false).await.unwrap();
        bucket.set_lister(&alice(), false).await.unwrap();
        assert!(!bucket.is_lister(&alice()));
    }
}
