use cidc_acl::AclError;
use cidc_storage::{Role, StoreError, UserId, UserStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("ledger error: {0}")]
    Ledger(#[from] StoreError),

    /// The object store rejected the engine's own credentials.
    #[error("object store denied access: {0}")]
    StoreFatal(AclError),

    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// Another process held the user's lease for longer than the lease lifetime.
    #[error("user {0} is locked by another process")]
    UserBusy(UserId),

    #[error("stale status change: event expects {expected}, ledger has {actual}")]
    StaleTransition {
        expected: UserStatus,
        actual: UserStatus,
    },

    #[error("invalid status change from {from} to {to}")]
    InvalidTransition { from: UserStatus, to: UserStatus },

    #[error("role {0} is not in the role policy")]
    RoleNotInPolicy(Role),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid role policy: {0}")]
    Policy(String),
}

impl AccessError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AccessError::StoreFatal(_))
    }
}
