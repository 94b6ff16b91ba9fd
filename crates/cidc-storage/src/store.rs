//! The Ledger trait that backends implement.

use chrono::{DateTime, Utc};

use crate::types::*;
use crate::StoreError;

/// The authoritative permission ledger `cidc-access` depends on.
///
/// Every mutation is a single short transaction. Timestamps are supplied by the caller so the
/// access layer controls the clock.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    // ───────────────────────────────────── Users ──────────────────────────────────────────

    /// Register a user on first login. Idempotent by email; an existing row is returned as is.
    async fn upsert_user(&self, params: &NewUser, at: DateTime<Utc>) -> Result<User, StoreError>;

    /// Get user by ID.
    async fn get_user(&self, user_id: &UserId) -> Result<User, StoreError>;

    /// Get user by email.
    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// List all users ordered by email.
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Record role and status. `approved_at` is set the first time the user is approved,
    /// `disabled_at` every time the status becomes disabled.
    async fn set_user_access(
        &self,
        user_id: &UserId,
        role: Option<Role>,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<User, StoreError>;

    /// Bump `last_accessed_at`.
    async fn touch_user(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Approved users whose last access is strictly before `cutoff`.
    async fn list_inactive_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>, StoreError>;

    /// Mark the user disabled and revoke every active permission (`user_disabled`) in one
    /// transaction. Returns the revoked snapshot.
    async fn disable_user(
        &self,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError>;

    // ───────────────────────────────────── Files ──────────────────────────────────────────

    /// Register a completed upload. Idempotent by `object_url`; returns `(file, created)`.
    async fn register_file(
        &self,
        params: &NewDownloadableFile,
        at: DateTime<Utc>,
    ) -> Result<(DownloadableFile, bool), StoreError>;

    /// Get file by ID.
    async fn get_file(&self, file_id: &FileId) -> Result<DownloadableFile, StoreError>;

    /// Facet/visibility correction.
    async fn set_file_visibility(
        &self,
        file_id: &FileId,
        visible: bool,
    ) -> Result<DownloadableFile, StoreError>;

    /// List files matching the filter.
    async fn list_files(&self, filter: &FileFilter) -> Result<Vec<DownloadableFile>, StoreError>;

    /// All trials with the upload types present in their files.
    async fn list_trials(&self) -> Result<Vec<Trial>, StoreError>;

    // ─────────────────────────────────── Permissions ──────────────────────────────────────

    /// Grant a permission. An existing active row for the same key is returned untouched
    /// with `created = false`; one already past its expiry is retired (`expired`) and replaced.
    /// A lost uniqueness race is `StoreError::Conflict`.
    async fn upsert_permission(
        &self,
        params: &NewPermission,
        at: DateTime<Utc>,
    ) -> Result<(Permission, bool), StoreError>;

    /// Get permission row by ID (active or not).
    async fn get_permission(&self, permission_id: &PermissionId) -> Result<Permission, StoreError>;

    /// The active row for exactly this key, if any.
    async fn find_active_permission(
        &self,
        user_id: &UserId,
        key: &PermissionKey,
    ) -> Result<Option<Permission>, StoreError>;

    /// Deactivate the active row for this key (`pending_revoke`). `None` when there is none.
    async fn revoke_permission(
        &self,
        user_id: &UserId,
        key: &PermissionKey,
        revocation: &Revocation,
    ) -> Result<Option<Permission>, StoreError>;

    /// Active, unexpired rows of a user.
    async fn list_active_for_user(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError>;

    /// Active, unexpired rows whose key is exact or wildcard on both sides of this resource.
    /// Callers apply [`PermissionKey::covers`] for the clinical-data rule.
    async fn list_active_for_resource(
        &self,
        trial_id: &TrialId,
        upload_type: &UploadType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError>;

    /// List rows matching the filter, newest first.
    async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, StoreError>;

    /// Rows the reconciler can make progress on, oldest change first: every `pending_revoke`
    /// row and the active `pending_grant` rows of approved users.
    async fn list_pending_acl(&self, limit: usize) -> Result<Vec<Permission>, StoreError>;

    /// Move a row to `state` only if it still has the `active` flag and `acl_state` of
    /// `expected`. Returns false when another writer changed the row first.
    async fn set_acl_state(
        &self,
        expected: &Permission,
        state: AclState,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically revoke every active row with `expires_at <= now` (`expired`,
    /// `pending_revoke`) and return them.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Permission>, StoreError>;

    /// Inactive rows of a user revoked for `reason` at or after `since`.
    async fn list_revoked_since(
        &self,
        user_id: &UserId,
        reason: RevocationReason,
        since: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError>;

    // ───────────────────────────────────── Leases ─────────────────────────────────────────

    /// Take the user's lease for `holder` until `until`. Succeeds when the lease is free,
    /// lapsed at `now`, or already held by `holder`.
    async fn acquire_user_lease(
        &self,
        user_id: &UserId,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop the user's lease if `holder` still has it.
    async fn release_user_lease(&self, user_id: &UserId, holder: &str) -> Result<(), StoreError>;
}
