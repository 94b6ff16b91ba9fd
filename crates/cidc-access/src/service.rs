use std::sync::Arc;

use chrono::{DateTime, Utc};
use cidc_acl::{BucketAcl, BucketAclAdapter};
use cidc_audit::{AuditAction, AuditEvent, AuditLog};
use cidc_storage::{
    AclState, DownloadableFile, GrantSource, Ledger, NewDownloadableFile, NewPermission,
    Permission, PermissionFilter, PermissionKey, Revocation, RevocationReason, Role, StoreError,
    TrialId, TrialScope, UploadScope, UploadType, User, UserId, UserStatus,
};
use serde::Serialize;
use tracing::info;

use crate::audit::Auditor;
use crate::clock::{Clock, SystemClock};
use crate::engine::{Convergence, GrantEngine};
use crate::listing::ListingService;
use crate::locks::UserLocks;
use crate::reconcile::{ReconcileMode, ReconcileReport, Reconciler};
use crate::roles::RolePolicy;
use crate::transitions::{RoleTransitionHandler, TransitionOutcome};
use crate::{AccessConfig, AccessError};

#[derive(Clone, Debug)]
pub struct GrantRequest {
    pub user_id: UserId,
    pub key: PermissionKey,
    pub granted_by: Option<UserId>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Ledger state after a grant plus how far the store got.
#[derive(Clone, Debug)]
pub struct GrantOutcome {
    pub permission: Permission,
    pub created: bool,
    pub convergence: Convergence,
}

#[derive(Clone, Debug)]
pub struct RevokeOutcome {
    /// `None` when there was no active grant to revoke.
    pub permission: Option<Permission>,
    pub convergence: Convergence,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegisterOutcome {
    pub file_id: String,
    pub created: bool,
    pub uploader_granted: bool,
    pub convergence: Convergence,
}

/// Entry point for admin actions, lifecycle events, listings and reconciliation.
pub struct AccessService {
    ledger: Arc<dyn Ledger>,
    engine: Arc<GrantEngine>,
    transitions: RoleTransitionHandler,
    listing: ListingService,
    reconciler: Reconciler,
    locks: UserLocks,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
}

pub struct AccessServiceBuilder {
    ledger: Arc<dyn Ledger>,
    acl: Arc<dyn BucketAcl>,
    policy: RolePolicy,
    clock: Arc<dyn Clock>,
    audit_log: Option<Arc<dyn AuditLog>>,
    config: AccessConfig,
}

impl AccessServiceBuilder {
    pub fn policy(mut self, policy: RolePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit_log(mut self, audit_log: Arc<dyn AuditLog>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> AccessService {
        let locks =
            UserLocks::with_lease(self.ledger.clone(), self.clock.clone(), self.config.user_lease);
        let auditor = Auditor::new(self.audit_log);
        let policy = Arc::new(self.policy);
        let concurrency = self.config.adapter.concurrency;
        let adapter = BucketAclAdapter::new(self.acl, self.config.adapter);

        let engine = Arc::new(GrantEngine::new(
            self.ledger.clone(),
            adapter,
            policy,
            self.clock.clone(),
            locks.clone(),
            auditor.clone(),
        ));
        let transitions = RoleTransitionHandler::new(
            self.ledger.clone(),
            engine.clone(),
            self.clock.clone(),
            locks.clone(),
            auditor.clone(),
            self.config.inactive_user_days,
        );
        let listing = ListingService::new(self.ledger.clone(), self.clock.clone());
        let reconciler = Reconciler::new(
            self.ledger.clone(),
            engine.clone(),
            self.clock.clone(),
            locks.clone(),
            auditor.clone(),
            self.config.pending_batch_limit,
            concurrency,
        );

        AccessService {
            ledger: self.ledger,
            engine,
            transitions,
            listing,
            reconciler,
            locks,
            auditor,
            clock: self.clock,
        }
    }
}

impl AccessService {
    pub fn builder(ledger: Arc<dyn Ledger>, acl: Arc<dyn BucketAcl>) -> AccessServiceBuilder {
        AccessServiceBuilder {
            ledger,
            acl,
            policy: RolePolicy::default(),
            clock: Arc::new(SystemClock),
            audit_log: None,
            config: AccessConfig::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn policy(&self) -> &RolePolicy {
        self.engine.policy()
    }

    /// Record an explicit grant and push it to the store.
    ///
    /// A duplicate of an applied grant returns the existing row without store calls. Store
    /// failures leave the row `pending_grant` for reconciliation; they are not errors.
    pub async fn grant(&self, request: GrantRequest) -> Result<GrantOutcome, AccessError> {
        let now = self.clock.now();
        if request.expires_at.is_some_and(|exp| exp <= now) {
            return Err(AccessError::InvalidRequest(
                "expiry must be in the future".to_string(),
            ));
        }

        let _guard = self.locks.lock(&request.user_id).await?;
        let user = self.load_user(&request.user_id).await?;

        let (permission, created) = self
            .engine
            .upsert_permission(&NewPermission {
                user_id: user.id.clone(),
                key: request.key.clone(),
                source: GrantSource::Explicit,
                granted_by: request.granted_by.clone(),
                expires_at: request.expires_at,
            })
            .await?;

        let (permission, convergence) = if !created && permission.acl_state == AclState::Applied
        {
            (permission, Convergence::NoOp)
        } else {
            let convergence = self.engine.apply_grant(&user, &permission).await?;
            (self.ledger.get_permission(&permission.id).await?, convergence)
        };

        info!(
            user = %user.email,
            key = %permission.key,
            created,
            convergence = ?convergence,
            "permission granted"
        );
        self.audit_permission(
            AuditAction::PermissionGrant,
            &permission,
            request.granted_by.as_ref(),
            &convergence,
        )
        .await;

        Ok(GrantOutcome {
            permission,
            created,
            convergence,
        })
    }

    /// Revoke the active grant for `key`. Revoking an absent grant is a no-op.
    pub async fn revoke(
        &self,
        user_id: &UserId,
        key: &PermissionKey,
        revoked_by: Option<&UserId>,
    ) -> Result<RevokeOutcome, AccessError> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.load_user(user_id).await?;

        let revocation = Revocation {
            reason: RevocationReason::Explicit,
            revoked_by: revoked_by.cloned(),
            at: self.clock.now(),
        };
        let Some(row) = self
            .ledger
            .revoke_permission(user_id, key, &revocation)
            .await?
        else {
            return Ok(RevokeOutcome {
                permission: None,
                convergence: Convergence::NoOp,
            });
        };

        let convergence = self.engine.apply_revoke(&user, &row).await?;
        let permission = self.ledger.get_permission(&row.id).await?;

        info!(user = %user.email, key = %key, convergence = ?convergence, "permission revoked");
        self.audit_permission(
            AuditAction::PermissionRevoke,
            &permission,
            revoked_by,
            &convergence,
        )
        .await;

        Ok(RevokeOutcome {
            permission: Some(permission),
            convergence,
        })
    }

    pub async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, AccessError> {
        self.listing.list_permissions(filter).await
    }

    pub async fn files_visible_to(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<DownloadableFile>, AccessError> {
        self.listing.files_visible_to(user_id).await
    }

    pub async fn users_with_access(
        &self,
        trial_id: &TrialId,
        upload_type: &UploadType,
    ) -> Result<Vec<User>, AccessError> {
        self.listing.users_with_access(trial_id, upload_type).await
    }

    pub async fn on_user_status_change(
        &self,
        user_id: &UserId,
        old: UserStatus,
        new: UserStatus,
        role: Option<Role>,
        actor: Option<&UserId>,
    ) -> Result<TransitionOutcome, AccessError> {
        self.transitions
            .on_user_status_change(user_id, old, new, role, actor)
            .await
    }

    /// Register a completed upload, give the uploader access to it and extend existing
    /// grants that cover the file's prefix.
    pub async fn register_file(
        &self,
        params: &NewDownloadableFile,
        uploader: Option<&UserId>,
    ) -> Result<RegisterOutcome, AccessError> {
        let (file, created) = self.ledger.register_file(params, self.clock.now()).await?;

        let mut uploader_granted = false;
        if let Some(uploader) = uploader {
            let _guard = self.locks.lock(uploader).await?;
            self.load_user(uploader).await?;
            let (_, granted) = self
                .engine
                .upsert_permission(&NewPermission {
                    user_id: uploader.clone(),
                    key: PermissionKey::exact(&file.trial_id, &file.upload_type),
                    source: GrantSource::Upload,
                    granted_by: None,
                    expires_at: None,
                })
                .await?;
            uploader_granted = granted;
        }

        let convergence = if created || uploader_granted {
            self.engine
                .extend_to_prefix(&file.trial_id, &file.upload_type)
                .await?
        } else {
            Convergence::NoOp
        };

        if created {
            info!(object = %file.object_url, trial = %file.trial_id, "file registered");
            self.auditor
                .record(
                    AuditEvent::builder(AuditAction::FileRegister)
                        .at(self.clock.now())
                        .actor(uploader)
                        .resource("file", file.id.to_string())
                        .trial_id(Some(&file.trial_id))
                        .upload_type(Some(&file.upload_type))
                        .result(convergence.audit_result())
                        .build(),
                )
                .await;
        }

        Ok(RegisterOutcome {
            file_id: file.id.to_string(),
            created,
            uploader_granted,
            convergence,
        })
    }

    pub async fn touch_user(&self, user_id: &UserId) -> Result<(), AccessError> {
        match self.ledger.touch_user(user_id, self.clock.now()).await {
            Err(StoreError::NotFound) => Err(AccessError::UserNotFound(user_id.clone())),
            other => Ok(other?),
        }
    }

    pub async fn disable_inactive_users(&self) -> Result<Vec<String>, AccessError> {
        self.transitions.disable_inactive_users().await
    }

    pub async fn reconcile(&self, mode: ReconcileMode) -> Result<ReconcileReport, AccessError> {
        self.reconciler.run_pass(mode).await
    }

    /// Wait for user leases still being released. Call before exiting.
    pub async fn shutdown(&self) {
        self.locks.flush().await;
    }

    async fn load_user(&self, user_id: &UserId) -> Result<User, AccessError> {
        match self.ledger.get_user(user_id).await {
            Err(StoreError::NotFound) => Err(AccessError::UserNotFound(user_id.clone())),
            other => Ok(other?),
        }
    }

    async fn audit_permission(
        &self,
        action: AuditAction,
        permission: &Permission,
        actor: Option<&UserId>,
        convergence: &Convergence,
    ) {
        let trial = match &permission.key.trial {
            TrialScope::Trial(t) => Some(t),
            TrialScope::Every => None,
        };
        let upload_type = match &permission.key.upload_type {
            UploadScope::Type(u) => Some(u),
            UploadScope::Every => None,
        };
        let mut event = AuditEvent::builder(action)
            .at(self.clock.now())
            .actor(actor)
            .subject(&permission.user_id)
            .resource("permission", permission.id.to_string())
            .trial_id(trial)
            .upload_type(upload_type)
            .result(convergence.audit_result());
        if let Convergence::Pending { prefixes } = convergence {
            event = event.details(serde_json::json!({ "pending_prefixes": prefixes }));
        }
        if permission.key.is_wildcard() {
            event = event.reason(permission.key.to_string());
        }
        self.auditor.record(event.build()).await;
    }
}
