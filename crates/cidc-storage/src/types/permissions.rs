//! Permission ledger types.
//!
//! A permission grants a user read access to files of one upload type within one trial.
//! Either side may be a wildcard ([`TrialScope::Every`], [`UploadScope::Every`]); wildcards
//! are persisted as [`WILDCARD`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{FileFilter, PermissionId, TrialId, UploadType, UserId};

/// Persisted form of a wildcard trial or upload type.
pub const WILDCARD: &str = "*";

/// Trial side of a permission key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TrialScope {
    Every,
    Trial(TrialId),
}

/// Upload-type side of a permission key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UploadScope {
    Every,
    Type(UploadType),
}

impl TrialScope {
    pub fn as_db(&self) -> &str {
        match self {
            TrialScope::Every => WILDCARD,
            TrialScope::Trial(t) => &t.0,
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s == WILDCARD {
            TrialScope::Every
        } else {
            TrialScope::Trial(TrialId(s.to_string()))
        }
    }

    pub fn matches(&self, trial: &TrialId) -> bool {
        match self {
            TrialScope::Every => true,
            TrialScope::Trial(t) => t == trial,
        }
    }
}

impl UploadScope {
    pub fn as_db(&self) -> &str {
        match self {
            UploadScope::Every => WILDCARD,
            UploadScope::Type(u) => &u.0,
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s == WILDCARD {
            UploadScope::Every
        } else {
            UploadScope::Type(UploadType(s.to_string()))
        }
    }

    /// The wildcard covers every upload type except clinical data.
    pub fn matches(&self, upload_type: &UploadType) -> bool {
        match self {
            UploadScope::Every => !upload_type.is_clinical_data(),
            UploadScope::Type(u) => u == upload_type,
        }
    }
}

impl From<String> for TrialScope {
    fn from(s: String) -> Self {
        TrialScope::from_db(&s)
    }
}

impl From<TrialScope> for String {
    fn from(scope: TrialScope) -> Self {
        scope.as_db().to_string()
    }
}

impl From<String> for UploadScope {
    fn from(s: String) -> Self {
        UploadScope::from_db(&s)
    }
}

impl From<UploadScope> for String {
    fn from(scope: UploadScope) -> Self {
        scope.as_db().to_string()
    }
}

/// The (trial, upload type) pair a permission is keyed on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionKey {
    pub trial: TrialScope,
    pub upload_type: UploadScope,
}

impl PermissionKey {
    pub fn new(trial: TrialScope, upload_type: UploadScope) -> Self {
        Self { trial, upload_type }
    }

    /// Build a key from persisted strings (`*` is a wildcard).
    pub fn from_db(trial: &str, upload_type: &str) -> Self {
        Self {
            trial: TrialScope::from_db(trial),
            upload_type: UploadScope::from_db(upload_type),
        }
    }

    pub fn exact(trial: &TrialId, upload_type: &UploadType) -> Self {
        Self {
            trial: TrialScope::Trial(trial.clone()),
            upload_type: UploadScope::Type(upload_type.clone()),
        }
    }

    pub fn everything() -> Self {
        Self {
            trial: TrialScope::Every,
            upload_type: UploadScope::Every,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.trial == TrialScope::Every || self.upload_type == UploadScope::Every
    }

    pub fn covers(&self, trial: &TrialId, upload_type: &UploadType) -> bool {
        self.trial.matches(trial) && self.upload_type.matches(upload_type)
    }

    /// Coarse file filter for this key. Callers still apply [`PermissionKey::covers`]
    /// to honor the clinical-data exclusion.
    pub fn file_filter(&self, visible_only: bool) -> FileFilter {
        FileFilter {
            trial_id: match &self.trial {
                TrialScope::Every => None,
                TrialScope::Trial(t) => Some(t.clone()),
            },
            upload_type: match &self.upload_type {
                UploadScope::Every => None,
                UploadScope::Type(u) => Some(u.clone()),
            },
            visible_only,
        }
    }
}

impl std::fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let upload = match &self.upload_type {
            UploadScope::Every => "all assays",
            UploadScope::Type(u) => u.0.as_str(),
        };
        let trial = match &self.trial {
            TrialScope::Every => "all trials",
            TrialScope::Trial(t) => t.0.as_str(),
        };
        write!(f, "{} on {}", upload, trial)
    }
}

/// Why a permission row exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    /// Granted by an administrator.
    Explicit,
    /// Implied by the user's role.
    Role,
    /// Uploader access to their own data.
    Upload,
}

impl GrantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantSource::Explicit => "explicit",
            GrantSource::Role => "role",
            GrantSource::Upload => "upload",
        }
    }
}

impl FromStr for GrantSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(GrantSource::Explicit),
            "role" => Ok(GrantSource::Role),
            "upload" => Ok(GrantSource::Upload),
            _ => Err(format!("invalid grant source: {}", s)),
        }
    }
}

/// Why a permission row was deactivated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Explicit,
    Expired,
    UserDisabled,
    RoleChanged,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Explicit => "explicit",
            RevocationReason::Expired => "expired",
            RevocationReason::UserDisabled => "user_disabled",
            RevocationReason::RoleChanged => "role_changed",
        }
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(RevocationReason::Explicit),
            "expired" => Ok(RevocationReason::Expired),
            "user_disabled" => Ok(RevocationReason::UserDisabled),
            "role_changed" => Ok(RevocationReason::RoleChanged),
            _ => Err(format!("invalid revocation reason: {}", s)),
        }
    }
}

/// Last known enforcement state of a permission row in the object store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclState {
    PendingGrant,
    Applied,
    PendingRevoke,
    Revoked,
}

impl AclState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclState::PendingGrant => "pending_grant",
            AclState::Applied => "applied",
            AclState::PendingRevoke => "pending_revoke",
            AclState::Revoked => "revoked",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AclState::PendingGrant | AclState::PendingRevoke)
    }
}

impl FromStr for AclState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_grant" => Ok(AclState::PendingGrant),
            "applied" => Ok(AclState::Applied),
            "pending_revoke" => Ok(AclState::PendingRevoke),
            "revoked" => Ok(AclState::Revoked),
            _ => Err(format!("invalid acl state: {}", s)),
        }
    }
}

/// Permission ledger row
#[derive(Clone, Debug)]
pub struct Permission {
    pub id: PermissionId,
    pub user_id: UserId,
    pub key: PermissionKey,
    pub source: GrantSource,
    pub granted_by: Option<UserId>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<UserId>,
    pub revocation_reason: Option<RevocationReason>,
    pub acl_state: AclState,
    pub acl_updated_at: DateTime<Utc>,
}

impl Permission {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Active and not yet past its expiry.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }
}

/// Parameters for granting a permission
#[derive(Clone, Debug)]
pub struct NewPermission {
    pub user_id: UserId,
    pub key: PermissionKey,
    pub source: GrantSource,
    pub granted_by: Option<UserId>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Who revoked a permission, why and when
#[derive(Clone, Debug)]
pub struct Revocation {
    pub reason: RevocationReason,
    pub revoked_by: Option<UserId>,
    pub at: DateTime<Utc>,
}

/// Filter for listing permissions
#[derive(Clone, Debug, Default)]
pub struct PermissionFilter {
    pub user_id: Option<UserId>,
    pub trial: Option<TrialScope>,
    pub upload_type: Option<UploadScope>,
    pub include_inactive: bool,
}
