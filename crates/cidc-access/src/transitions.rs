//! Account lifecycle events and the permission deltas they imply.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use cidc_audit::{AuditAction, AuditEvent};
use cidc_storage::{
    GrantSource, Ledger, NewPermission, PermissionKey, Revocation, RevocationReason,
    Role, StoreError, User, UserId, UserStatus,
};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::Auditor;
use crate::clock::Clock;
use crate::engine::{Convergence, GrantEngine};
use crate::locks::UserLocks;
use crate::AccessError;

/// Result of a status change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The ledger already reflects the event.
    NoOp,
    /// Approval without a role; nothing changed.
    Ignored,
    Approved(Convergence),
    /// Number of rows revoked and how far their removal got.
    Disabled {
        revoked: usize,
        convergence: Convergence,
    },
    /// Number of rows restored on reactivation.
    Reactivated {
        restored: usize,
        convergence: Convergence,
    },
    RoleChanged {
        granted: Vec<PermissionKey>,
        revoked: Vec<PermissionKey>,
        convergence: Convergence,
    },
    /// Role stored for a pending or disabled user; no permission changes.
    RoleRecorded,
}

pub struct RoleTransitionHandler {
    ledger: Arc<dyn Ledger>,
    engine: Arc<GrantEngine>,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
    auditor: Auditor,
    inactive_user_days: i64,
}

impl RoleTransitionHandler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: Arc<GrantEngine>,
        clock: Arc<dyn Clock>,
        locks: UserLocks,
        auditor: Auditor,
        inactive_user_days: i64,
    ) -> Self {
        Self {
            ledger,
            engine,
            clock,
            locks,
            auditor,
            inactive_user_days,
        }
    }

    /// Apply a lifecycle event emitted by the identity side of the portal.
    ///
    /// `old` is the status the emitter saw. Redelivered events are no-ops; events that no
    /// longer match the ledger are rejected as stale.
    pub async fn on_user_status_change(
        &self,
        user_id: &UserId,
        old: UserStatus,
        new: UserStatus,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        if new == UserStatus::Pending && old != UserStatus::Pending {
            return Err(AccessError::InvalidTransition { from: old, to: new });
        }

        let _guard = self.locks.lock(user_id).await?;
        let user = self.load_user(user_id).await?;

        if user.status == new && user.role == role {
            debug!(user = %user.email, status = %new, "status change already applied");
            return Ok(TransitionOutcome::NoOp);
        }
        if user.status != old {
            return Err(AccessError::StaleTransition {
                expected: old,
                actual: user.status,
            });
        }

        match (old, new) {
            (UserStatus::Pending, UserStatus::Approved) => self.approve(user, role, actor).await,
            (UserStatus::Pending | UserStatus::Approved, UserStatus::Disabled) => {
                self.disable(user, role, actor).await
            }
            (UserStatus::Disabled, UserStatus::Approved) => {
                self.reactivate(user, role, actor).await
            }
            (UserStatus::Approved, UserStatus::Approved) => {
                self.change_role(user, role, actor).await
            }
            (UserStatus::Pending, UserStatus::Pending)
            | (UserStatus::Disabled, UserStatus::Disabled) => {
                self.require_in_policy(role)?;
                self.ledger
                    .set_user_access(&user.id, role, user.status, self.clock.now())
                    .await?;
                Ok(TransitionOutcome::RoleRecorded)
            }
            (from, to) => Err(AccessError::InvalidTransition { from, to }),
        }
    }

    /// Disable approved users idle for longer than the configured window. Returns their emails.
    pub async fn disable_inactive_users(&self) -> Result<Vec<String>, AccessError> {
        let cutoff = self.clock.now() - Duration::days(self.inactive_user_days);
        let mut disabled = Vec::new();
        for user in self.ledger.list_inactive_users(cutoff).await? {
            match self
                .on_user_status_change(
                    &user.id,
                    UserStatus::Approved,
                    UserStatus::Disabled,
                    user.role,
                    None,
                )
                .await
            {
                Ok(TransitionOutcome::Disabled { .. }) => disabled.push(user.email),
                Ok(_) => {}
                Err(AccessError::StaleTransition { actual, .. }) => {
                    debug!(user = %user.email, status = %actual, "user changed before inactivity disable");
                }
                Err(e) => return Err(e),
            }
        }
        if !disabled.is_empty() {
            info!(count = disabled.len(), "disabled inactive users");
        }
        Ok(disabled)
    }

    async fn approve(
        &self,
        user: User,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        let Some(role) = role else {
            debug!(user = %user.email, "approval without a role ignored");
            return Ok(TransitionOutcome::Ignored);
        };
        self.require_in_policy(Some(role))?;

        let user = self
            .ledger
            .set_user_access(&user.id, Some(role), UserStatus::Approved, self.clock.now())
            .await?;
        let granted = self.grant_implied(&user, actor).await?;
        let convergence = self.engine.converge_user(&user).await?;

        info!(user = %user.email, role = %role, "user approved");
        self.audit_user(
            AuditAction::UserApprove,
            &user,
            actor,
            &convergence,
            json!({ "role": role.as_str(), "implied": keys_json(&granted) }),
        )
        .await;
        Ok(TransitionOutcome::Approved(convergence))
    }

    async fn disable(
        &self,
        user: User,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        let snapshot = self.ledger.disable_user(&user.id, self.clock.now()).await?;
        let user = if role != user.role {
            self.require_in_policy(role)?;
            self.ledger
                .set_user_access(&user.id, role, UserStatus::Disabled, self.clock.now())
                .await?
        } else {
            self.load_user(&user.id).await?
        };

        let mut convergence = Convergence::NoOp;
        for row in &snapshot {
            convergence = convergence.merge(self.engine.apply_revoke(&user, row).await?);
        }

        info!(user = %user.email, revoked = snapshot.len(), "user disabled");
        self.audit_user(
            AuditAction::UserDisable,
            &user,
            actor,
            &convergence,
            json!({ "revoked": keys_json(snapshot.iter().map(|p| &p.key)) }),
        )
        .await;
        Ok(TransitionOutcome::Disabled {
            revoked: snapshot.len(),
            convergence,
        })
    }

    async fn reactivate(
        &self,
        user: User,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        let Some(role) = role else {
            debug!(user = %user.email, "reactivation without a role ignored");
            return Ok(TransitionOutcome::Ignored);
        };
        self.require_in_policy(Some(role))?;

        let now = self.clock.now();
        // Only rows revoked by the most recent disable come back.
        let revoked = match user.disabled_at {
            Some(since) => {
                self.ledger
                    .list_revoked_since(&user.id, RevocationReason::UserDisabled, since)
                    .await?
            }
            None => Vec::new(),
        };

        let user = self
            .ledger
            .set_user_access(&user.id, Some(role), UserStatus::Approved, now)
            .await?;

        let mut restored = 0;
        for row in revoked
            .iter()
            .filter(|row| row.source != GrantSource::Role && !row.is_expired(now))
        {
            let (_, created) = self
                .engine
                .upsert_permission(&NewPermission {
                    user_id: user.id.clone(),
                    key: row.key.clone(),
                    source: row.source,
                    granted_by: row.granted_by.clone(),
                    expires_at: row.expires_at,
                })
                .await?;
            if created {
                restored += 1;
            }
        }
        self.grant_implied(&user, actor).await?;
        let convergence = self.engine.converge_user(&user).await?;

        info!(user = %user.email, role = %role, restored, "user reactivated");
        self.audit_user(
            AuditAction::UserReactivate,
            &user,
            actor,
            &convergence,
            json!({ "role": role.as_str(), "restored": restored }),
        )
        .await;
        Ok(TransitionOutcome::Reactivated {
            restored,
            convergence,
        })
    }

    async fn change_role(
        &self,
        user: User,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        self.require_in_policy(role)?;
        let policy = self.engine.policy();
        let old_role = user.role;
        let old_keys = policy.implied_keys(old_role);
        let new_keys = policy.implied_keys(role);
        let store_flip = policy.store_access(old_role) != policy.store_access(role);

        let user = self
            .ledger
            .set_user_access(&user.id, role, UserStatus::Approved, self.clock.now())
            .await?;

        // Explicit and upload rows survive a role change even when the old role implied them.
        let mut revoked_rows = Vec::new();
        for key in old_keys.difference(&new_keys) {
            let Some(row) = self.ledger.find_active_permission(&user.id, key).await? else {
                continue;
            };
            if row.source != GrantSource::Role {
                continue;
            }
            let revocation = Revocation {
                reason: RevocationReason::RoleChanged,
                revoked_by: actor.cloned(),
                at: self.clock.now(),
            };
            if let Some(row) = self
                .ledger
                .revoke_permission(&user.id, key, &revocation)
                .await?
            {
                revoked_rows.push(row);
            }
        }

        let mut granted_rows = Vec::new();
        for key in new_keys.difference(&old_keys) {
            let (row, created) = self
                .engine
                .upsert_permission(&role_grant(&user.id, key, actor))
                .await?;
            if created {
                granted_rows.push(row);
            }
        }

        let convergence = if store_flip {
            self.engine.converge_user(&user).await?
        } else {
            let mut convergence = Convergence::NoOp;
            for row in &revoked_rows {
                convergence = convergence.merge(self.engine.apply_revoke(&user, row).await?);
            }
            for row in &granted_rows {
                convergence = convergence.merge(self.engine.apply_grant(&user, row).await?);
            }
            convergence
        };

        let granted: Vec<PermissionKey> = granted_rows.iter().map(|p| p.key.clone()).collect();
        let revoked: Vec<PermissionKey> = revoked_rows.iter().map(|p| p.key.clone()).collect();
        info!(
            user = %user.email,
            from = ?old_role.map(|r| r.as_str()),
            to = ?role.map(|r| r.as_str()),
            granted = granted.len(),
            revoked = revoked.len(),
            "role changed"
        );
        self.audit_user(
            AuditAction::UserRoleChange,
            &user,
            actor,
            &convergence,
            json!({
                "from": old_role.map(|r| r.as_str()),
                "to": role.map(|r| r.as_str()),
                "granted": keys_json(&granted),
                "revoked": keys_json(&revoked),
            }),
        )
        .await;
        Ok(TransitionOutcome::RoleChanged {
            granted,
            revoked,
            convergence,
        })
    }

    async fn grant_implied(
        &self,
        user: &User,
        actor: Option<&UserId>,
    ) -> Result<BTreeSet<PermissionKey>, AccessError> {
        let keys = self.engine.policy().implied_keys(user.role);
        for key in &keys {
            self.engine
                .upsert_permission(&role_grant(&user.id, key, actor))
                .await?;
        }
        Ok(keys)
    }

    fn require_in_policy(&self, role: Option<Role>) -> Result<(), AccessError> {
        match role {
            Some(role) if !self.engine.policy().contains(role) => {
                Err(AccessError::RoleNotInPolicy(role))
            }
            _ => Ok(()),
        }
    }

    async fn load_user(&self, user_id: &UserId) -> Result<User, AccessError> {
        match self.ledger.get_user(user_id).await {
            Err(StoreError::NotFound) => Err(AccessError::UserNotFound(user_id.clone())),
            other => Ok(other?),
        }
    }

    async fn audit_user(
        &self,
        action: AuditAction,
        user: &User,
        actor: Option<&UserId>,
        convergence: &Convergence,
        details: serde_json::Value,
    ) {
        self.auditor
            .record(
                AuditEvent::builder(action)
                    .at(self.clock.now())
                    .actor(actor)
                    .subject(&user.id)
                    .resource("user", user.id.to_string())
                    .result(convergence.audit_result())
                    .details(details)
                    .build(),
            )
            .await;
    }
}

fn role_grant(user_id: &UserId, key: &PermissionKey, actor: Option<&UserId>) -> NewPermission {
    NewPermission {
        user_id: user_id.clone(),
        key: key.clone(),
        source: GrantSource::Role,
        granted_by: actor.cloned(),
        expires_at: None,
    }
}

fn keys_json<'a>(keys: impl IntoIterator<Item = &'a PermissionKey>) -> serde_json::Value {
    keys.into_iter()
        .map(|k| json!({ "trial": k.trial.as_db(), "upload_type": k.upload_type.as_db() }))
        .collect()
}
