//! Audit trail of access changes to the cidc data bucket.
//!
//! Every grant, revoke, lifecycle transition and reconciliation outcome is written as an
//! [`AuditEvent`] through the [`AuditLog`] trait. Recording is best-effort for callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidc_storage::{TrialId, UploadType, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Time-ordered (v7) id of an audit row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditLogId(pub Uuid);

impl AuditLogId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AuditLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AuditLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AuditLogId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Categories of auditable actions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Permission ledger
    PermissionGrant,
    PermissionRevoke,
    PermissionExpire,

    // Account lifecycle
    UserApprove,
    UserDisable,
    UserReactivate,
    UserRoleChange,

    // Object store enforcement
    AclPending,
    AclFatal,
    ReconcilePass,

    // File catalog
    FileRegister,
}

impl AuditAction {
    pub const ALL: [AuditAction; 11] = [
        AuditAction::PermissionGrant,
        AuditAction::PermissionRevoke,
        AuditAction::PermissionExpire,
        AuditAction::UserApprove,
        AuditAction::UserDisable,
        AuditAction::UserReactivate,
        AuditAction::UserRoleChange,
        AuditAction::AclPending,
        AuditAction::AclFatal,
        AuditAction::ReconcilePass,
        AuditAction::FileRegister,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PermissionGrant => "permission.grant",
            AuditAction::PermissionRevoke => "permission.revoke",
            AuditAction::PermissionExpire => "permission.expire",
            AuditAction::UserApprove => "user.approve",
            AuditAction::UserDisable => "user.disable",
            AuditAction::UserReactivate => "user.reactivate",
            AuditAction::UserRoleChange => "user.role_change",
            AuditAction::AclPending => "acl.pending",
            AuditAction::AclFatal => "acl.fatal",
            AuditAction::ReconcilePass => "reconcile.pass",
            AuditAction::FileRegister => "file.register",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("Unknown audit action: {}", s))
    }
}

/// Result of an audited operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    /// Recorded in the ledger, object store not yet converged.
    Pending,
    PermissionDenied,
    /// The operation failed before completing; see the event's reason.
    Error,
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditResult::Success => "success",
            AuditResult::Pending => "pending",
            AuditResult::PermissionDenied => "permission_denied",
            AuditResult::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditResult::Success),
            "pending" => Ok(AuditResult::Pending),
            "permission_denied" => Ok(AuditResult::PermissionDenied),
            "error" => Ok(AuditResult::Error),
            _ => Err(format!("Unknown audit result: {}", s)),
        }
    }
}

/// An audit log entry representing a single auditable action.
///
/// Uses raw UUIDs and strings for serialization compatibility. Use the builder
/// to construct events from typed IDs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for this audit entry
    pub id: AuditLogId,
    /// When the action occurred
    pub timestamp: DateTime<Utc>,
    /// Administrator who performed the action (None for system actions)
    pub actor_user_id: Option<Uuid>,
    /// User whose access changed
    pub subject_user_id: Option<Uuid>,
    /// The action that was performed
    pub action: AuditAction,
    /// Type of resource affected (e.g., "permission", "user", "file")
    pub resource_type: String,
    /// Identifier of the affected resource
    pub resource_id: String,
    /// Trial context (None for wildcards or non-trial actions)
    pub trial_id: Option<String>,
    /// Upload type context
    pub upload_type: Option<String>,
    /// Result of the operation
    pub result: AuditResult,
    /// Error message or additional context
    pub reason: Option<String>,
    /// Additional details as JSON (e.g., old/new role, pending prefixes)
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn builder(action: AuditAction) -> AuditEventBuilder {
        AuditEventBuilder::new(action)
    }

    pub fn get_actor_user_id(&self) -> Option<UserId> {
        self.actor_user_id.map(UserId)
    }

    pub fn get_subject_user_id(&self) -> Option<UserId> {
        self.subject_user_id.map(UserId)
    }
}

pub struct AuditEventBuilder {
    action: AuditAction,
    timestamp: Option<DateTime<Utc>>,
    actor_user_id: Option<Uuid>,
    subject_user_id: Option<Uuid>,
    resource_type: String,
    resource_id: String,
    trial_id: Option<String>,
    upload_type: Option<String>,
    result: AuditResult,
    reason: Option<String>,
    details: Option<serde_json::Value>,
}

impl AuditEventBuilder {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            timestamp: None,
            actor_user_id: None,
            subject_user_id: None,
            resource_type: String::new(),
            resource_id: String::new(),
            trial_id: None,
            upload_type: None,
            result: AuditResult::Success,
            reason: None,
            details: None,
        }
    }

    /// Event time; defaults to now.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn actor(mut self, actor: Option<&UserId>) -> Self {
        self.actor_user_id = actor.map(|u| u.0);
        self
    }

    pub fn subject(mut self, subject: &UserId) -> Self {
        self.subject_user_id = Some(subject.0);
        self
    }

    pub fn resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id.into();
        self
    }

    pub fn trial_id(mut self, trial_id: Option<&TrialId>) -> Self {
        self.trial_id = trial_id.map(|t| t.0.clone());
        self
    }

    pub fn upload_type(mut self, upload_type: Option<&UploadType>) -> Self {
        self.upload_type = upload_type.map(|u| u.0.clone());
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: AuditLogId::new(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            actor_user_id: self.actor_user_id,
            subject_user_id: self.subject_user_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            trial_id: self.trial_id,
            upload_type: self.upload_type,
            result: self.result,
            reason: self.reason,
            details: self.details,
        }
    }
}

/// Narrowing filter for audit queries; unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct AuditLogFilter {
    pub actor_user_id: Option<UserId>,
    pub subject_user_id: Option<UserId>,
    pub trial_id: Option<TrialId>,
    pub action: Option<AuditAction>,
    pub result: Option<AuditResult>,
    /// Inclusive lower bound on `timestamp`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `timestamp`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditLogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything that happened to one user's access.
    pub fn for_subject(user_id: UserId) -> Self {
        Self {
            subject_user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn actor(mut self, user_id: UserId) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    pub fn trial(mut self, trial_id: TrialId) -> Self {
        self.trial_id = Some(trial_id);
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Restrict to `[from, to)`.
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("database error: {0}")]
    Database(String),

    #[error("audit log not found: {0}")]
    NotFound(AuditLogId),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditLogError>;

    /// Matching events, newest first.
    async fn query(&self, filter: AuditLogFilter) -> Result<Vec<AuditEvent>, AuditLogError>;

    async fn get(&self, id: AuditLogId) -> Result<AuditEvent, AuditLogError>;

    async fn count(&self, filter: AuditLogFilter) -> Result<u64, AuditLogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_action_display() {
        assert_eq!(AuditAction::PermissionGrant.to_string(), "permission.grant");
        assert_eq!(AuditAction::UserRoleChange.to_string(), "user.role_change");
        assert_eq!(AuditAction::AclFatal.to_string(), "acl.fatal");
    }

    #[test]
    fn test_audit_action_parse() {
        assert_eq!(
            "permission.revoke".parse::<AuditAction>().unwrap(),
            AuditAction::PermissionRevoke
        );
        assert!("secret.create".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_audit_action_all_variants_roundtrip() {
        for action in AuditAction::ALL {
            let parsed: AuditAction = action.to_string().parse().unwrap();
            assert_eq!(action, parsed);
        }
    }

    #[test]
    fn test_audit_result_roundtrip() {
        for result in [
            AuditResult::Success,
            AuditResult::Pending,
            AuditResult::PermissionDenied,
            AuditResult::Error,
        ] {
            let parsed: AuditResult = result.to_string().parse().unwrap();
            assert_eq!(result, parsed);
        }
        assert!("ok".parse::<AuditResult>().is_err());
    }

    #[test]
    fn test_audit_event_builder() {
        let admin = UserId(Uuid::now_v7());
        let subject = UserId(Uuid::now_v7());
        let event = AuditEvent::builder(AuditAction::PermissionGrant)
            .actor(Some(&admin))
            .subject(&subject)
            .resource("permission", "abc")
            .trial_id(Some(&TrialId::new("10021")))
            .upload_type(Some(&UploadType::new("wes")))
            .result(AuditResult::Pending)
            .build();

        assert_eq!(event.get_actor_user_id(), Some(admin));
        assert_eq!(event.get_subject_user_id(), Some(subject));
        assert_eq!(event.resource_type, "permission");
        assert_eq!(event.trial_id.as_deref(), Some("10021"));
        assert_eq!(event.upload_type.as_deref(), Some("wes"));
        assert_eq!(event.result, AuditResult::Pending);
    }

    #[test]
    fn test_audit_event_builder_explicit_timestamp() {
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = AuditEvent::builder(AuditAction::ReconcilePass).at(at).build();
        assert_eq!(event.timestamp, at);
        assert!(event.actor_user_id.is_none());
    }

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::builder(AuditAction::AclFatal)
            .resource("bucket", "cidc-data")
            .result(AuditResult::PermissionDenied)
            .reason("403 from store")
            .details(serde_json::json!({"prefixes": ["10021/wes"]}))
            .build();

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: AuditEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(event.id, deserialized.id);
        assert_eq!(event.action, deserialized.action);
        assert_eq!(deserialized.reason.as_deref(), Some("403 from store"));
    }

    #[test]
    fn test_audit_log_filter_builder() {
        let subject = UserId(Uuid::now_v7());
        let filter = AuditLogFilter::for_subject(subject.clone())
            .action(AuditAction::UserDisable)
            .trial(TrialId::new("10021"))
            .page(10, 20);
        assert_eq!(filter.subject_user_id, Some(subject));
        assert_eq!(filter.action, Some(AuditAction::UserDisable));
        assert_eq!(filter.trial_id, Some(TrialId::new("10021")));
        assert_eq!((filter.limit, filter.offset), (Some(10), Some(20)));
        assert!(filter.actor_user_id.is_none());
    }
}
