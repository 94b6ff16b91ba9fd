//! Grant/revoke engine: turns ledger rows into object-store read grants.
//!
//! Callers hold the user's lock from [`UserLocks`] around every method that touches a
//! single user. [`GrantEngine::extend_to_prefix`] takes the locks it needs itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cidc_acl::{AclChange, AclError, AclPrefix, AclReport, BucketAclAdapter, ChangeOutcome};
use cidc_audit::{AuditAction, AuditEvent, AuditResult};
use cidc_storage::{
    AclState, Ledger, NewPermission, Permission, PermissionFilter, PermissionKey, StoreError,
    TrialId, UploadType, User, UserId, UserStatus,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::Auditor;
use crate::clock::Clock;
use crate::locks::UserLocks;
use crate::paths::{prefixes_for_key, principal_for};
use crate::roles::RolePolicy;
use crate::AccessError;

/// How far the object store got toward the ledger's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Convergence {
    /// Nothing to do.
    NoOp,
    /// The user's role has no store access; the ledger row alone is enough.
    NotRequired,
    /// Every store change was applied.
    Applied,
    /// The user is not approved yet; enforcement waits for approval.
    Deferred,
    /// Some prefixes are still to be applied by reconciliation.
    Pending { prefixes: BTreeSet<AclPrefix> },
}

impl Convergence {
    pub fn is_pending(&self) -> bool {
        matches!(self, Convergence::Pending { .. })
    }

    /// Settled as far as the store is concerned.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Convergence::NoOp | Convergence::NotRequired | Convergence::Applied
        )
    }

    /// Combine two results, keeping the least converged one.
    pub fn merge(self, other: Convergence) -> Convergence {
        match (self, other) {
            (Convergence::Pending { mut prefixes }, Convergence::Pending { prefixes: more }) => {
                prefixes.extend(more);
                Convergence::Pending { prefixes }
            }
            (p @ Convergence::Pending { .. }, _) | (_, p @ Convergence::Pending { .. }) => p,
            (a, b) => {
                if a.rank() >= b.rank() {
                    a
                } else {
                    b
                }
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Convergence::NoOp => 0,
            Convergence::NotRequired => 1,
            Convergence::Applied => 2,
            Convergence::Deferred => 3,
            Convergence::Pending { .. } => 4,
        }
    }

    pub(crate) fn audit_result(&self) -> AuditResult {
        if self.is_settled() {
            AuditResult::Success
        } else {
            AuditResult::Pending
        }
    }
}

pub struct GrantEngine {
    ledger: Arc<dyn Ledger>,
    adapter: BucketAclAdapter,
    policy: Arc<RolePolicy>,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
    auditor: Auditor,
}

impl GrantEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        adapter: BucketAclAdapter,
        policy: Arc<RolePolicy>,
        clock: Arc<dyn Clock>,
        locks: UserLocks,
        auditor: Auditor,
    ) -> Self {
        Self {
            ledger,
            adapter,
            policy,
            clock,
            locks,
            auditor,
        }
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    /// Approved and holding a role with store access.
    pub fn is_enforced(&self, user: &User) -> bool {
        user.is_approved() && self.policy.store_access(user.role)
    }

    /// Write a row, retrying once when a concurrent writer won the uniqueness race.
    pub async fn upsert_permission(
        &self,
        params: &NewPermission,
    ) -> Result<(Permission, bool), AccessError> {
        match self.ledger.upsert_permission(params, self.clock.now()).await {
            Err(StoreError::Conflict) => {
                debug!(user_id = %params.user_id, key = %params.key, "grant raced; retrying");
                Ok(self
                    .ledger
                    .upsert_permission(params, self.clock.now())
                    .await?)
            }
            other => Ok(other?),
        }
    }

    /// Object-store prefixes a key projects onto given the current file catalog.
    pub async fn resolve_prefixes(
        &self,
        key: &PermissionKey,
    ) -> Result<BTreeSet<AclPrefix>, AccessError> {
        let trials = self.ledger.list_trials().await?;
        Ok(prefixes_for_key(key, &trials))
    }

    /// Prefixes the user should be able to read right now.
    pub async fn entitled_prefixes(&self, user: &User) -> Result<BTreeSet<AclPrefix>, AccessError> {
        if !self.is_enforced(user) {
            return Ok(BTreeSet::new());
        }
        let rows = self
            .ledger
            .list_active_for_user(&user.id, self.clock.now())
            .await?;
        if rows.is_empty() {
            return Ok(BTreeSet::new());
        }
        let trials = self.ledger.list_trials().await?;
        Ok(rows
            .iter()
            .flat_map(|row| prefixes_for_key(&row.key, &trials))
            .collect())
    }

    pub async fn apply_grant(
        &self,
        user: &User,
        permission: &Permission,
    ) -> Result<Convergence, AccessError> {
        let now = self.clock.now();
        if !permission.is_effective(now) {
            return Ok(Convergence::NoOp);
        }
        if !user.is_approved() {
            return Ok(Convergence::Deferred);
        }
        if !self.policy.store_access(user.role) {
            // Nothing reached the store, so a concurrent revoke needs no cleanup.
            self.ledger
                .set_acl_state(permission, AclState::Applied, now)
                .await?;
            return Ok(Convergence::NotRequired);
        }

        let principal = principal_for(user);
        let prefixes = self.resolve_prefixes(&permission.key).await?;
        let grants_any = !prefixes.is_empty();
        let changes = prefixes
            .into_iter()
            .map(|prefix| AclChange::add(principal.clone(), prefix))
            .collect();
        let report = self.apply_changes(Some(&user.id), changes).await?;

        if !report.all_settled() {
            return Ok(Convergence::Pending {
                prefixes: report.pending_prefixes(),
            });
        }
        if grants_any && !self.sync_lister(user, true).await? {
            return Ok(Convergence::Pending {
                prefixes: BTreeSet::new(),
            });
        }
        if self
            .ledger
            .set_acl_state(permission, AclState::Applied, self.clock.now())
            .await?
        {
            Ok(Convergence::Applied)
        } else {
            self.converge_after_race(user, permission).await
        }
    }

    /// Remove the store grants of a revoked row that no other active row still justifies.
    pub async fn apply_revoke(
        &self,
        user: &User,
        permission: &Permission,
    ) -> Result<Convergence, AccessError> {
        if permission.active || permission.acl_state == AclState::Revoked {
            return Ok(Convergence::NoOp);
        }

        let entitled = self.entitled_prefixes(user).await?;
        let principal = principal_for(user);
        let changes = self
            .resolve_prefixes(&permission.key)
            .await?
            .into_iter()
            .filter(|prefix| !entitled.contains(prefix))
            .map(|prefix| AclChange::remove(principal.clone(), prefix))
            .collect();
        let report = self.apply_changes(Some(&user.id), changes).await?;

        if !report.all_settled() {
            return Ok(Convergence::Pending {
                prefixes: report.pending_prefixes(),
            });
        }
        if entitled.is_empty() && !self.sync_lister(user, false).await? {
            return Ok(Convergence::Pending {
                prefixes: BTreeSet::new(),
            });
        }
        if self
            .ledger
            .set_acl_state(permission, AclState::Revoked, self.clock.now())
            .await?
        {
            Ok(Convergence::Applied)
        } else {
            self.converge_after_race(user, permission).await
        }
    }

    /// The row was changed by another writer while its store changes were in flight.
    /// Converge the user from what the ledger says now.
    async fn converge_after_race(
        &self,
        user: &User,
        permission: &Permission,
    ) -> Result<Convergence, AccessError> {
        warn!(
            user = %user.email,
            permission = %permission.id,
            "permission changed during store update; converging user"
        );
        self.converge_user(user).await
    }

    /// Bring the store in line with the ledger for one user by diffing desired against
    /// actual grants, then settle the user's pending rows.
    pub async fn converge_user(&self, user: &User) -> Result<Convergence, AccessError> {
        let principal = principal_for(user);
        let desired = self.entitled_prefixes(user).await?;

        let listing = match self.adapter.list_grants(&principal).await {
            Ok(listing) => listing,
            Err(err @ AclError::PermissionDenied(_)) => return Err(AccessError::StoreFatal(err)),
            Err(err) => {
                warn!(user = %user.email, error = %err, "cannot list store grants; convergence pending");
                return Ok(Convergence::Pending { prefixes: desired });
            }
        };

        let actual = listing.prefixes();
        // Grants about to lapse are written again like missing ones.
        let renew = listing.renewals_due();
        let mut changes: Vec<AclChange> = desired
            .iter()
            .filter(|prefix| !actual.contains(*prefix) || renew.contains(*prefix))
            .map(|prefix| AclChange::add(principal.clone(), prefix.clone()))
            .collect();
        changes.extend(
            actual
                .difference(&desired)
                .map(|prefix| AclChange::remove(principal.clone(), prefix.clone())),
        );
        if !changes.is_empty() {
            debug!(user = %user.email, changes = changes.len(), "converging user");
        }

        let report = self.apply_changes(Some(&user.id), changes).await?;
        if !report.all_settled() {
            return Ok(Convergence::Pending {
                prefixes: report.pending_prefixes(),
            });
        }
        let lister = !desired.is_empty();
        if listing.lister != lister && !self.sync_lister(user, lister).await? {
            return Ok(Convergence::Pending {
                prefixes: BTreeSet::new(),
            });
        }

        self.settle_pending_rows(user).await?;

        Ok(match user.status {
            UserStatus::Pending => Convergence::Deferred,
            UserStatus::Approved if !self.policy.store_access(user.role) => {
                Convergence::NotRequired
            }
            _ => Convergence::Applied,
        })
    }

    /// Grant a newly created prefix to every enforced user whose active rows cover it.
    pub async fn extend_to_prefix(
        &self,
        trial_id: &TrialId,
        upload_type: &UploadType,
    ) -> Result<Convergence, AccessError> {
        let prefix = AclPrefix::for_upload(trial_id, upload_type);

        let user_ids: Vec<UserId> = self
            .ledger
            .list_active_for_resource(trial_id, upload_type, self.clock.now())
            .await?
            .into_iter()
            .filter(|row| row.key.covers(trial_id, upload_type))
            .map(|row| row.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if user_ids.is_empty() {
            return Ok(Convergence::NoOp);
        }

        let _guards = self.locks.lock_many(&user_ids).await?;

        // Rows listed before the locks were taken may have been revoked or expired since.
        let now = self.clock.now();
        let mut rows_by_user: BTreeMap<UserId, Vec<Permission>> = BTreeMap::new();
        for user_id in &user_ids {
            let rows: Vec<Permission> = self
                .ledger
                .list_active_for_user(user_id, now)
                .await?
                .into_iter()
                .filter(|row| row.key.covers(trial_id, upload_type))
                .collect();
            if !rows.is_empty() {
                rows_by_user.insert(user_id.clone(), rows);
            }
        }
        if rows_by_user.is_empty() {
            return Ok(Convergence::NoOp);
        }

        let mut changes = Vec::new();
        let mut enforced = Vec::new();
        for user_id in rows_by_user.keys() {
            let user = self.ledger.get_user(user_id).await?;
            if self.is_enforced(&user) {
                changes.push(AclChange::add(principal_for(&user), prefix.clone()));
                enforced.push(user);
            }
        }
        if changes.is_empty() {
            return Ok(Convergence::NotRequired);
        }

        let report = self.apply_changes(None, changes).await?;
        if !report.all_settled() {
            return Ok(Convergence::Pending {
                prefixes: report.pending_prefixes(),
            });
        }

        let mut convergence = Convergence::Applied;
        let trials = self.ledger.list_trials().await?;
        for user in &enforced {
            if !self.sync_lister(user, true).await? {
                convergence = convergence.merge(Convergence::Pending {
                    prefixes: BTreeSet::new(),
                });
                continue;
            }
            // Rows waiting only on this prefix are now fully applied.
            for row in rows_by_user.get(&user.id).into_iter().flatten() {
                if row.acl_state == AclState::PendingGrant
                    && prefixes_for_key(&row.key, &trials)
                        .iter()
                        .all(|p| p == &prefix)
                {
                    self.ledger
                        .set_acl_state(row, AclState::Applied, self.clock.now())
                        .await?;
                }
            }
        }
        Ok(convergence)
    }

    async fn settle_pending_rows(&self, user: &User) -> Result<(), AccessError> {
        let now = self.clock.now();
        let rows = self
            .ledger
            .list_permissions(&PermissionFilter {
                user_id: Some(user.id.clone()),
                include_inactive: true,
                ..Default::default()
            })
            .await?;
        for row in rows {
            let settled = match row.acl_state {
                AclState::PendingGrant if row.active && user.is_approved() => AclState::Applied,
                AclState::PendingRevoke => AclState::Revoked,
                _ => continue,
            };
            if !self.ledger.set_acl_state(&row, settled, now).await? {
                debug!(permission = %row.id, "row changed while settling; left for the next pass");
            }
        }
        Ok(())
    }

    /// Grant or withdraw the bucket listing role. Returns false when the change is left
    /// pending.
    async fn sync_lister(&self, user: &User, enabled: bool) -> Result<bool, AccessError> {
        let outcome = self
            .adapter
            .set_lister(&principal_for(user), enabled)
            .await
            .map_err(AccessError::StoreFatal)?;
        crate::metrics::record_lister(enabled, &outcome);
        Ok(!matches!(outcome, ChangeOutcome::Pending(_)))
    }

    async fn apply_changes(
        &self,
        subject: Option<&UserId>,
        changes: Vec<AclChange>,
    ) -> Result<AclReport, AccessError> {
        if changes.is_empty() {
            return Ok(AclReport::default());
        }
        let report = self
            .adapter
            .apply(changes)
            .await
            .map_err(AccessError::StoreFatal)?;
        crate::metrics::record_acl_report(&report);

        if !report.all_settled() {
            let pending: Vec<String> = report
                .pending_prefixes()
                .iter()
                .map(|p| p.to_string())
                .collect();
            let mut event = AuditEvent::builder(AuditAction::AclPending)
                .at(self.clock.now())
                .resource("acl", pending.join(","))
                .result(AuditResult::Pending)
                .details(json!({ "pending_prefixes": pending }));
            if let Some(subject) = subject {
                event = event.subject(subject);
            }
            self.auditor.record(event.build()).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cidc_acl::AdapterConfig;
    use cidc_acl_memory::MemoryBucket;
    use cidc_storage::{GrantSource, MockLedger, PermissionId, Role, Trial};
    use uuid::Uuid;

    use crate::clock::SystemClock;

    fn permission(user_id: &UserId, key: PermissionKey) -> Permission {
        let now = Utc::now();
        Permission {
            id: PermissionId(Uuid::now_v7()),
            user_id: user_id.clone(),
            key,
            source: GrantSource::Explicit,
            granted_by: None,
            granted_at: now,
            expires_at: None,
            active: true,
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
            acl_state: AclState::PendingGrant,
            acl_updated_at: now,
        }
    }

    fn engine(ledger: MockLedger) -> GrantEngine {
        engine_with(ledger, Arc::new(MemoryBucket::new()))
    }

    fn engine_with(ledger: MockLedger, bucket: Arc<MemoryBucket>) -> GrantEngine {
        GrantEngine::new(
            Arc::new(ledger),
            BucketAclAdapter::new(bucket, AdapterConfig::default()),
            Arc::new(RolePolicy::default()),
            Arc::new(SystemClock),
            UserLocks::new(),
            Auditor::default(),
        )
    }

    fn request(user_id: &UserId) -> NewPermission {
        NewPermission {
            user_id: user_id.clone(),
            key: PermissionKey::from_db("10021", "wes_bam"),
            source: GrantSource::Explicit,
            granted_by: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_retries_once_after_conflict() {
        let user_id = UserId(Uuid::now_v7());
        let row = permission(&user_id, PermissionKey::from_db("10021", "wes_bam"));

        let mut ledger = MockLedger::new();
        let mut seq = mockall::Sequence::new();
        ledger
            .expect_upsert_permission()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StoreError::Conflict));
        ledger
            .expect_upsert_permission()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok((row.clone(), false)));

        let (permission, created) = engine(ledger)
            .upsert_permission(&request(&user_id))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(permission.user_id, user_id);
    }

    #[tokio::test]
    async fn test_second_conflict_is_surfaced() {
        let user_id = UserId(Uuid::now_v7());
        let mut ledger = MockLedger::new();
        ledger
            .expect_upsert_permission()
            .times(2)
            .returning(|_, _| Err(StoreError::Conflict));

        let err = engine(ledger)
            .upsert_permission(&request(&user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Ledger(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_expired_row_is_not_applied() {
        let user_id = UserId(Uuid::now_v7());
        let mut row = permission(&user_id, PermissionKey::everything());
        row.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));

        // No ledger expectations: an expired row must not touch the ledger.
        let engine = engine(MockLedger::new());
        let user = approved_user(&user_id);
        assert_eq!(
            engine.apply_grant(&user, &row).await.unwrap(),
            Convergence::NoOp
        );
    }

    fn approved_user(user_id: &UserId) -> User {
        User {
            id: user_id.clone(),
            email: "a@example.org".into(),
            organization: None,
            role: Some(Role::CimacUser),
            status: UserStatus::Approved,
            approved_at: None,
            disabled_at: None,
            last_accessed_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn catalog() -> Vec<Trial> {
        vec![Trial {
            trial_id: TrialId::new("10021"),
            upload_types: vec![UploadType::new("wes_bam")],
            created_at: Utc::now(),
        }]
    }

    #[tokio::test]
    async fn test_grant_that_loses_a_revoke_race_is_undone() {
        let user_id = UserId(Uuid::now_v7());
        let row = permission(&user_id, PermissionKey::from_db("10021", "wes_bam"));
        let mut revoked = row.clone();
        revoked.active = false;
        revoked.acl_state = AclState::PendingRevoke;

        let mut ledger = MockLedger::new();
        ledger.expect_list_trials().returning(|| Ok(catalog()));
        let mut seq = mockall::Sequence::new();
        // The revoke lands while the store call is in flight.
        ledger
            .expect_set_acl_state()
            .withf(|row, state, _| row.active && *state == AclState::Applied)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(false));
        ledger
            .expect_list_active_for_user()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Vec::new()));
        let listed = revoked.clone();
        ledger
            .expect_list_permissions()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(vec![listed.clone()]));
        ledger
            .expect_set_acl_state()
            .withf(|row, state, _| !row.active && *state == AclState::Revoked)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));

        let bucket = Arc::new(MemoryBucket::new());
        let engine = engine_with(ledger, bucket.clone());
        let user = approved_user(&user_id);

        let convergence = engine.apply_grant(&user, &row).await.unwrap();
        assert_eq!(convergence, Convergence::Applied);
        assert!(bucket.snapshot().is_empty());
        assert!(!bucket.is_lister(&principal_for(&user)));
    }

    #[tokio::test]
    async fn test_extend_skips_rows_revoked_before_the_lock_was_taken() {
        let user_id = UserId(Uuid::now_v7());
        let row = permission(&user_id, PermissionKey::from_db("10021", "wes_bam"));

        let mut ledger = MockLedger::new();
        ledger
            .expect_list_active_for_resource()
            .times(1)
            .returning(move |_, _, _| Ok(vec![row.clone()]));
        ledger
            .expect_list_active_for_user()
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        ledger.expect_get_user().never();

        let bucket = Arc::new(MemoryBucket::new());
        let engine = engine_with(ledger, bucket.clone());
        let convergence = engine
            .extend_to_prefix(&TrialId::new("10021"), &UploadType::new("wes_bam"))
            .await
            .unwrap();
        assert_eq!(convergence, Convergence::NoOp);
        assert_eq!(bucket.calls(), 0);
        assert!(bucket.snapshot().is_empty());
    }

    #[test]
    fn test_merge_keeps_least_converged() {
        let a = Convergence::Pending {
            prefixes: BTreeSet::from([AclPrefix::new("t1/wes")]),
        };
        let b = Convergence::Pending {
            prefixes: BTreeSet::from([AclPrefix::new("t1/olink")]),
        };
        assert_eq!(
            Convergence::Applied.merge(a.clone()).merge(b),
            Convergence::Pending {
                prefixes: BTreeSet::from([AclPrefix::new("t1/olink"), AclPrefix::new("t1/wes")])
            }
        );
        assert_eq!(
            Convergence::NoOp.merge(Convergence::Applied),
            Convergence::Applied
        );
        assert_eq!(
            Convergence::Deferred.merge(Convergence::NotRequired),
            Convergence::Deferred
        );
        assert!(!a.is_settled());
    }
}
