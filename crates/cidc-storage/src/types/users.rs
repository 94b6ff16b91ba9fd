//! User types.

use chrono::{DateTime, Utc};

use super::{Role, UserId, UserStatus};

/// User record
#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub organization: Option<String>,
    pub role: Option<Role>,
    pub status: UserStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>, // Most recent disable
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_approved(&self) -> bool {
        self.status == UserStatus::Approved
    }
}

/// Parameters for registering a user on first login
#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub organization: Option<String>,
}
