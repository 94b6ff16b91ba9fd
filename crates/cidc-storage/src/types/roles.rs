//! Portal roles and account status.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Portal role assigned by an administrator on approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "cidc-admin")]
    Admin,
    #[serde(rename = "cidc-biofx-user")]
    CidcBiofxUser,
    #[serde(rename = "cimac-biofx-user")]
    CimacBiofxUser,
    #[serde(rename = "cimac-user")]
    CimacUser,
    #[serde(rename = "developer")]
    Developer,
    #[serde(rename = "devops")]
    Devops,
    #[serde(rename = "nci-biobank-user")]
    NciBiobankUser,
    #[serde(rename = "network-viewer")]
    NetworkViewer,
    #[serde(rename = "pact-user")]
    PactUser,
}

/// Error type for parsing Role from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoleError(pub String);

impl std::fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid role: {}", self.0)
    }
}

impl std::error::Error for ParseRoleError {}

impl Role {
    pub const ALL: [Role; 9] = [
        Role::Admin,
        Role::CidcBiofxUser,
        Role::CimacBiofxUser,
        Role::CimacUser,
        Role::Developer,
        Role::Devops,
        Role::NciBiobankUser,
        Role::NetworkViewer,
        Role::PactUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "cidc-admin",
            Role::CidcBiofxUser => "cidc-biofx-user",
            Role::CimacBiofxUser => "cimac-biofx-user",
            Role::CimacUser => "cimac-user",
            Role::Developer => "developer",
            Role::Devops => "devops",
            Role::NciBiobankUser => "nci-biobank-user",
            Role::NetworkViewer => "network-viewer",
            Role::PactUser => "pact-user",
        }
    }
}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ParseRoleError(s.to_string()))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Pending,
    Approved,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Approved => "approved",
            UserStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserStatus::Pending),
            "approved" => Ok(UserStatus::Approved),
            "disabled" => Ok(UserStatus::Disabled),
            _ => Err(format!("invalid user status: {}", s)),
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in Role::ALL {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(role, parsed);
        }
    }

    #[test]
    fn test_role_parse_invalid() {
        assert!("admin".parse::<Role>().is_err());
        assert!("CIDC-ADMIN".parse::<Role>().is_err());
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_uses_portal_names() {
        let json = serde_json::to_string(&Role::NetworkViewer).unwrap();
        assert_eq!(json, "\"network-viewer\"");
        let parsed: Role = serde_json::from_str("\"cidc-admin\"").unwrap();
        assert_eq!(parsed, Role::Admin);
    }

    #[test]
    fn test_user_status_parse() {
        assert_eq!("approved".parse::<UserStatus>().unwrap(), UserStatus::Approved);
        assert!("active".parse::<UserStatus>().is_err());
    }

    #[test]
    fn test_parse_role_error_display() {
        let err = ParseRoleError("unknown".to_string());
        assert!(err.to_string().contains("unknown"));
    }
}
