use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cidc_storage::{
    AclState, DownloadableFile, FileFilter, FileId, Ledger, NewDownloadableFile, NewPermission,
    NewUser, Permission, PermissionFilter, PermissionId, PermissionKey, Revocation,
    RevocationReason, Role, StoreError, Trial, TrialId, UploadType, User, UserId, UserStatus,
};
use uuid::Uuid;

use crate::rows::{
    collect, FileRow, PermissionRow, UserRow, FILE_COLUMNS, PERMISSION_COLUMNS, USER_COLUMNS,
};
use crate::{backend, is_unique_violation, to_millis, SqliteLedger};

/// Deactivate rows fetched before an in-transaction revoke so callers see the committed state.
fn mark_revoked(perms: &mut [Permission], revocation: &Revocation) {
    for p in perms {
        p.active = false;
        p.revoked_at = Some(revocation.at);
        p.revoked_by = revocation.revoked_by.clone();
        p.revocation_reason = Some(revocation.reason);
        p.acl_state = AclState::PendingRevoke;
        p.acl_updated_at = revocation.at;
    }
}

impl SqliteLedger {
    async fn fetch_permission(&self, id: &str) -> Result<Permission, StoreError> {
        let sql = format!("SELECT {} FROM permissions WHERE id = ?", PERMISSION_COLUMNS);
        let row = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        Permission::try_from(row)
    }
}

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    // ───────────────────────────── Users ─────────────────────────────

    async fn upsert_user(&self, params: &NewUser, at: DateTime<Utc>) -> Result<User, StoreError> {
        let ts = to_millis(at);
        sqlx::query(
            "INSERT INTO users(id, email, organization, status, last_accessed_at, created_at, updated_at)
             VALUES(?, ?, ?, 'pending', ?, ?, ?)
             ON CONFLICT(email) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(&params.email)
        .bind(&params.organization)
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.get_user_by_email(&params.email).await
    }

    async fn get_user(&self, user_id: &UserId) -> Result<User, StoreError> {
        let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user_id.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        User::try_from(row)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let sql = format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        User::try_from(row)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {} FROM users ORDER BY email", USER_COLUMNS);
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    async fn set_user_access(
        &self,
        user_id: &UserId,
        role: Option<Role>,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let ts = to_millis(at);
        let result = sqlx::query(
            "UPDATE users SET
               role = ?,
               status = ?,
               approved_at = CASE WHEN ? = 'approved' AND approved_at IS NULL THEN ? ELSE approved_at END,
               disabled_at = CASE WHEN ? = 'disabled' AND status != 'disabled' THEN ? ELSE disabled_at END,
               updated_at = ?
             WHERE id = ?",
        )
        .bind(role.map(|r| r.as_str()))
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(ts)
        .bind(status.as_str())
        .bind(ts)
        .bind(ts)
        .bind(user_id.0.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_user(user_id).await
    }

    async fn touch_user(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET last_accessed_at = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(user_id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_inactive_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {} FROM users WHERE status = 'approved' AND last_accessed_at < ? ORDER BY email",
            USER_COLUMNS
        );
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    async fn disable_user(
        &self,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError> {
        let ts = to_millis(at);
        let uid = user_id.0.to_string();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let result = sqlx::query(
            "UPDATE users SET status = 'disabled', disabled_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ts)
        .bind(ts)
        .bind(&uid)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let sql = format!(
            "SELECT {} FROM permissions WHERE user_id = ? AND active = 1 ORDER BY granted_at",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(&uid)
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;
        let mut snapshot: Vec<Permission> = collect(rows)?;

        sqlx::query(
            "UPDATE permissions SET
               active = 0, revoked_at = ?, revoked_by = NULL, revocation_reason = 'user_disabled',
               acl_state = 'pending_revoke', acl_updated_at = ?
             WHERE user_id = ? AND active = 1",
        )
        .bind(ts)
        .bind(ts)
        .bind(&uid)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        mark_revoked(
            &mut snapshot,
            &Revocation {
                reason: RevocationReason::UserDisabled,
                revoked_by: None,
                at,
            },
        );
        Ok(snapshot)
    }

    // ───────────────────────────── Files ─────────────────────────────

    async fn register_file(
        &self,
        params: &NewDownloadableFile,
        at: DateTime<Utc>,
    ) -> Result<(DownloadableFile, bool), StoreError> {
        let ts = to_millis(at);
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let sql = format!(
            "SELECT {} FROM downloadable_files WHERE object_url = ?",
            FILE_COLUMNS
        );
        let existing = sqlx::query_as::<_, FileRow>(&sql)
            .bind(&params.object_url)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if let Some(row) = existing {
            return Ok((DownloadableFile::try_from(row)?, false));
        }

        sqlx::query("INSERT INTO trials(trial_id, created_at) VALUES(?, ?) ON CONFLICT(trial_id) DO NOTHING")
            .bind(&params.trial_id.0)
            .bind(ts)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let id = FileId(Uuid::now_v7());
        sqlx::query(
            "INSERT INTO downloadable_files(id, trial_id, upload_type, object_url, md5_hash, file_size_bytes, facet_group, visible, uploaded_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(id.0.to_string())
        .bind(&params.trial_id.0)
        .bind(&params.upload_type.0)
        .bind(&params.object_url)
        .bind(&params.md5_hash)
        .bind(params.file_size_bytes)
        .bind(&params.facet_group)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict
            } else {
                backend(e)
            }
        })?;

        tx.commit().await.map_err(backend)?;

        Ok((
            DownloadableFile {
                id,
                trial_id: params.trial_id.clone(),
                upload_type: params.upload_type.clone(),
                object_url: params.object_url.clone(),
                md5_hash: params.md5_hash.clone(),
                file_size_bytes: params.file_size_bytes,
                facet_group: params.facet_group.clone(),
                visible: true,
                uploaded_at: at,
            },
            true,
        ))
    }

    async fn get_file(&self, file_id: &FileId) -> Result<DownloadableFile, StoreError> {
        let sql = format!("SELECT {} FROM downloadable_files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(file_id.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        DownloadableFile::try_from(row)
    }

    async fn set_file_visibility(
        &self,
        file_id: &FileId,
        visible: bool,
    ) -> Result<DownloadableFile, StoreError> {
        let result = sqlx::query("UPDATE downloadable_files SET visible = ? WHERE id = ?")
            .bind(visible)
            .bind(file_id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_file(file_id).await
    }

    async fn list_files(&self, filter: &FileFilter) -> Result<Vec<DownloadableFile>, StoreError> {
        let mut sql = format!("SELECT {} FROM downloadable_files WHERE 1 = 1", FILE_COLUMNS);
        if filter.trial_id.is_some() {
            sql.push_str(" AND trial_id = ?");
        }
        if filter.upload_type.is_some() {
            sql.push_str(" AND upload_type = ?");
        }
        if filter.visible_only {
            sql.push_str(" AND visible = 1");
        }
        sql.push_str(" ORDER BY trial_id, upload_type, object_url");

        let mut query = sqlx::query_as::<_, FileRow>(&sql);
        if let Some(trial_id) = &filter.trial_id {
            query = query.bind(&trial_id.0);
        }
        if let Some(upload_type) = &filter.upload_type {
            query = query.bind(&upload_type.0);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        collect(rows)
    }

    async fn list_trials(&self) -> Result<Vec<Trial>, StoreError> {
        let trials = sqlx::query_as::<_, (String, i64)>(
            "SELECT trial_id, created_at FROM trials ORDER BY trial_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let pairs = sqlx::query_as::<_, (String, String)>(
            "SELECT DISTINCT trial_id, upload_type FROM downloadable_files ORDER BY trial_id, upload_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut upload_types: BTreeMap<String, Vec<UploadType>> = BTreeMap::new();
        for (trial_id, upload_type) in pairs {
            upload_types
                .entry(trial_id)
                .or_default()
                .push(UploadType(upload_type));
        }

        trials
            .into_iter()
            .map(|(trial_id, created_at)| {
                Ok(Trial {
                    upload_types: upload_types.remove(&trial_id).unwrap_or_default(),
                    trial_id: TrialId(trial_id),
                    created_at: crate::from_millis(created_at)?,
                })
            })
            .collect()
    }

    // ─────────────────────────── Permissions ───────────────────────────

    async fn upsert_permission(
        &self,
        params: &NewPermission,
        at: DateTime<Utc>,
    ) -> Result<(Permission, bool), StoreError> {
        let uid = params.user_id.0.to_string();
        let trial = params.key.trial.as_db();
        let upload_type = params.key.upload_type.as_db();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let sql = format!(
            "SELECT {} FROM permissions WHERE user_id = ? AND trial_id = ? AND upload_type = ? AND active = 1",
            PERMISSION_COLUMNS
        );
        let existing = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(&uid)
            .bind(trial)
            .bind(upload_type)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let ts = to_millis(at);
        if let Some(row) = existing {
            let current = Permission::try_from(row)?;
            if !current.is_expired(at) {
                return Ok((current, false));
            }
            // Expired but not yet swept: retire it so the grant starts a fresh row.
            sqlx::query(
                "UPDATE permissions SET
                   active = 0, revoked_at = ?, revoked_by = NULL, revocation_reason = 'expired',
                   acl_state = 'pending_revoke', acl_updated_at = ?
                 WHERE id = ?",
            )
            .bind(ts)
            .bind(ts)
            .bind(current.id.0.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        let id = PermissionId(Uuid::now_v7());
        sqlx::query(
            "INSERT INTO permissions(id, user_id, trial_id, upload_type, source, granted_by, granted_at, expires_at, active, acl_state, acl_updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, 'pending_grant', ?)",
        )
        .bind(id.0.to_string())
        .bind(&uid)
        .bind(trial)
        .bind(upload_type)
        .bind(params.source.as_str())
        .bind(params.granted_by.as_ref().map(|u| u.0.to_string()))
        .bind(ts)
        .bind(params.expires_at.map(to_millis))
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict
            } else {
                backend(e)
            }
        })?;

        tx.commit().await.map_err(backend)?;

        Ok((
            Permission {
                id,
                user_id: params.user_id.clone(),
                key: params.key.clone(),
                source: params.source,
                granted_by: params.granted_by.clone(),
                granted_at: at,
                expires_at: params.expires_at,
                active: true,
                revoked_at: None,
                revoked_by: None,
                revocation_reason: None,
                acl_state: AclState::PendingGrant,
                acl_updated_at: at,
            },
            true,
        ))
    }

    async fn get_permission(&self, permission_id: &PermissionId) -> Result<Permission, StoreError> {
        self.fetch_permission(&permission_id.0.to_string()).await
    }

    async fn find_active_permission(
        &self,
        user_id: &UserId,
        key: &PermissionKey,
    ) -> Result<Option<Permission>, StoreError> {
        let sql = format!(
            "SELECT {} FROM permissions WHERE user_id = ? AND trial_id = ? AND upload_type = ? AND active = 1",
            PERMISSION_COLUMNS
        );
        let row = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(user_id.0.to_string())
            .bind(key.trial.as_db())
            .bind(key.upload_type.as_db())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Permission::try_from).transpose()
    }

    async fn revoke_permission(
        &self,
        user_id: &UserId,
        key: &PermissionKey,
        revocation: &Revocation,
    ) -> Result<Option<Permission>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let sql = format!(
            "SELECT {} FROM permissions WHERE user_id = ? AND trial_id = ? AND upload_type = ? AND active = 1",
            PERMISSION_COLUMNS
        );
        let row = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(user_id.0.to_string())
            .bind(key.trial.as_db())
            .bind(key.upload_type.as_db())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut perm = Permission::try_from(row)?;

        let ts = to_millis(revocation.at);
        sqlx::query(
            "UPDATE permissions SET
               active = 0, revoked_at = ?, revoked_by = ?, revocation_reason = ?,
               acl_state = 'pending_revoke', acl_updated_at = ?
             WHERE id = ? AND active = 1",
        )
        .bind(ts)
        .bind(revocation.revoked_by.as_ref().map(|u| u.0.to_string()))
        .bind(revocation.reason.as_str())
        .bind(ts)
        .bind(perm.id.0.to_string())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        mark_revoked(std::slice::from_mut(&mut perm), revocation);
        Ok(Some(perm))
    }

    async fn list_active_for_user(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError> {
        let sql = format!(
            "SELECT {} FROM permissions
             WHERE user_id = ? AND active = 1 AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY granted_at",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(user_id.0.to_string())
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    async fn list_active_for_resource(
        &self,
        trial_id: &TrialId,
        upload_type: &UploadType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError> {
        let sql = format!(
            "SELECT {} FROM permissions
             WHERE active = 1
               AND (trial_id = ? OR trial_id = '*')
               AND (upload_type = ? OR upload_type = '*')
               AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY granted_at",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(&trial_id.0)
            .bind(&upload_type.0)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, StoreError> {
        let mut sql = format!("SELECT {} FROM permissions WHERE 1 = 1", PERMISSION_COLUMNS);
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.trial.is_some() {
            sql.push_str(" AND trial_id = ?");
        }
        if filter.upload_type.is_some() {
            sql.push_str(" AND upload_type = ?");
        }
        if !filter.include_inactive {
            sql.push_str(" AND active = 1");
        }
        sql.push_str(" ORDER BY granted_at DESC, id DESC");

        let mut query = sqlx::query_as::<_, PermissionRow>(&sql);
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id.0.to_string());
        }
        if let Some(trial) = &filter.trial {
            query = query.bind(trial.as_db());
        }
        if let Some(upload_type) = &filter.upload_type {
            query = query.bind(upload_type.as_db());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        collect(rows)
    }

    async fn list_pending_acl(&self, limit: usize) -> Result<Vec<Permission>, StoreError> {
        let sql = format!(
            "SELECT {} FROM permissions
             WHERE acl_state = 'pending_revoke'
                OR (acl_state = 'pending_grant' AND active = 1
                    AND user_id IN (SELECT id FROM users WHERE status = 'approved'))
             ORDER BY acl_updated_at, id
             LIMIT ?",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    async fn set_acl_state(
        &self,
        expected: &Permission,
        state: AclState,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE permissions SET acl_state = ?, acl_updated_at = ?
             WHERE id = ? AND active = ? AND acl_state = ?",
        )
        .bind(state.as_str())
        .bind(to_millis(at))
        .bind(expected.id.0.to_string())
        .bind(expected.active)
        .bind(expected.acl_state.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Permission>, StoreError> {
        let ts = to_millis(now);
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let sql = format!(
            "SELECT {} FROM permissions
             WHERE active = 1 AND expires_at IS NOT NULL AND expires_at <= ?
             ORDER BY expires_at",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(ts)
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;
        let mut expired: Vec<Permission> = collect(rows)?;
        if expired.is_empty() {
            return Ok(expired);
        }

        sqlx::query(
            "UPDATE permissions SET
               active = 0, revoked_at = ?, revoked_by = NULL, revocation_reason = 'expired',
               acl_state = 'pending_revoke', acl_updated_at = ?
             WHERE active = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        mark_revoked(
            &mut expired,
            &Revocation {
                reason: RevocationReason::Expired,
                revoked_by: None,
                at: now,
            },
        );
        Ok(expired)
    }

    async fn list_revoked_since(
        &self,
        user_id: &UserId,
        reason: RevocationReason,
        since: DateTime<Utc>,
    ) -> Result<Vec<Permission>, StoreError> {
        let sql = format!(
            "SELECT {} FROM permissions
             WHERE user_id = ? AND active = 0 AND revocation_reason = ? AND revoked_at >= ?
             ORDER BY granted_at",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PermissionRow>(&sql)
            .bind(user_id.0.to_string())
            .bind(reason.as_str())
            .bind(to_millis(since))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        collect(rows)
    }

    // ───────────────────────────── Leases ─────────────────────────────

    async fn acquire_user_lease(
        &self,
        user_id: &UserId,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO user_leases(user_id, holder, expires_at) VALUES(?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
               holder = excluded.holder, expires_at = excluded.expires_at
             WHERE user_leases.expires_at <= ? OR user_leases.holder = excluded.holder",
        )
        .bind(user_id.0.to_string())
        .bind(holder)
        .bind(to_millis(until))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_user_lease(&self, user_id: &UserId, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_leases WHERE user_id = ? AND holder = ?")
            .bind(user_id.0.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
