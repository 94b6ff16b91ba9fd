//! Raw table rows and their conversion into ledger types.

use cidc_storage::{
    AclState, DownloadableFile, FileId, GrantSource, Permission, PermissionId, PermissionKey,
    RevocationReason, Role, StoreError, TrialId, UploadType, User, UserId, UserStatus,
};

use crate::{backend, from_millis, parse_uuid};

pub(crate) const USER_COLUMNS: &str = "id, email, organization, role, status, approved_at, \
     disabled_at, last_accessed_at, created_at, updated_at";

pub(crate) const FILE_COLUMNS: &str = "id, trial_id, upload_type, object_url, md5_hash, \
     file_size_bytes, facet_group, visible, uploaded_at";

pub(crate) const PERMISSION_COLUMNS: &str = "id, user_id, trial_id, upload_type, source, \
     granted_by, granted_at, expires_at, active, revoked_at, revoked_by, revocation_reason, \
     acl_state, acl_updated_at";

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    id: String,
    email: String,
    organization: Option<String>,
    role: Option<String>,
    status: String,
    approved_at: Option<i64>,
    disabled_at: Option<i64>,
    last_accessed_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: UserId(parse_uuid(&row.id)?),
            email: row.email,
            organization: row.organization,
            role: row.role.map(|r| r.parse::<Role>()).transpose().map_err(backend)?,
            status: row.status.parse::<UserStatus>().map_err(backend)?,
            approved_at: row.approved_at.map(from_millis).transpose()?,
            disabled_at: row.disabled_at.map(from_millis).transpose()?,
            last_accessed_at: from_millis(row.last_accessed_at)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    id: String,
    trial_id: String,
    upload_type: String,
    object_url: String,
    md5_hash: Option<String>,
    file_size_bytes: i64,
    facet_group: String,
    visible: bool,
    uploaded_at: i64,
}

impl TryFrom<FileRow> for DownloadableFile {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(DownloadableFile {
            id: FileId(parse_uuid(&row.id)?),
            trial_id: TrialId(row.trial_id),
            upload_type: UploadType(row.upload_type),
            object_url: row.object_url,
            md5_hash: row.md5_hash,
            file_size_bytes: row.file_size_bytes,
            facet_group: row.facet_group,
            visible: row.visible,
            uploaded_at: from_millis(row.uploaded_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PermissionRow {
    id: String,
    user_id: String,
    trial_id: String,
    upload_type: String,
    source: String,
    granted_by: Option<String>,
    granted_at: i64,
    expires_at: Option<i64>,
    active: bool,
    revoked_at: Option<i64>,
    revoked_by: Option<String>,
    revocation_reason: Option<String>,
    acl_state: String,
    acl_updated_at: i64,
}

impl TryFrom<PermissionRow> for Permission {
    type Error = StoreError;

    fn try_from(row: PermissionRow) -> Result<Self, Self::Error> {
        Ok(Permission {
            id: PermissionId(parse_uuid(&row.id)?),
            user_id: UserId(parse_uuid(&row.user_id)?),
            key: PermissionKey::from_db(&row.trial_id, &row.upload_type),
            source: row.source.parse::<GrantSource>().map_err(backend)?,
            granted_by: row
                .granted_by
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(UserId),
            granted_at: from_millis(row.granted_at)?,
            expires_at: row.expires_at.map(from_millis).transpose()?,
            active: row.active,
            revoked_at: row.revoked_at.map(from_millis).transpose()?,
            revoked_by: row
                .revoked_by
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(UserId),
            revocation_reason: row
                .revocation_reason
                .map(|r| r.parse::<RevocationReason>())
                .transpose()
                .map_err(backend)?,
            acl_state: row.acl_state.parse::<AclState>().map_err(backend)?,
            acl_updated_at: from_millis(row.acl_updated_at)?,
        })
    }
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
