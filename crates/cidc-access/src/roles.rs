//! Role policy: which roles get object-store access and which permissions a role implies.
//!
//! The table is versioned and can be loaded from JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "roles": {
//!     "cidc-admin": {
//!       "store_access": true,
//!       "implied": [{"trial": "*", "upload_type": "*"}, {"trial": "*", "upload_type": "clinical_data"}]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use cidc_storage::{PermissionKey, Role, TrialScope, UploadScope, UploadType};
use serde::{Deserialize, Serialize};

use crate::AccessError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Whether permissions of this role are enforced in the object store.
    pub store_access: bool,
    /// Keys granted with `source = role` while the user holds the role.
    #[serde(default)]
    pub implied: Vec<PermissionKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub version: u32,
    pub roles: BTreeMap<Role, RoleEntry>,
}

impl Default for RolePolicy {
    fn default() -> Self {
        let everything = PermissionKey::everything();
        let all_clinical = PermissionKey::new(
            TrialScope::Every,
            UploadScope::Type(UploadType::new(UploadType::CLINICAL_DATA)),
        );

        let mut roles = BTreeMap::new();
        for role in Role::ALL {
            let entry = match role {
                Role::Admin => RoleEntry {
                    store_access: true,
                    implied: vec![everything.clone(), all_clinical.clone()],
                },
                Role::NciBiobankUser => RoleEntry {
                    store_access: true,
                    implied: vec![everything.clone()],
                },
                // Sees every listing, downloads nothing.
                Role::NetworkViewer => RoleEntry {
                    store_access: false,
                    implied: vec![everything.clone()],
                },
                Role::PactUser => RoleEntry {
                    store_access: false,
                    implied: Vec::new(),
                },
                Role::CidcBiofxUser
                | Role::CimacBiofxUser
                | Role::CimacUser
                | Role::Developer
                | Role::Devops => RoleEntry {
                    store_access: true,
                    implied: Vec::new(),
                },
            };
            roles.insert(role, entry);
        }

        Self { version: 1, roles }
    }
}

impl RolePolicy {
    pub fn from_json_str(json: &str) -> Result<Self, AccessError> {
        serde_json::from_str(json).map_err(|e| AccessError::Policy(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, AccessError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AccessError::Policy(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn contains(&self, role: Role) -> bool {
        self.roles.contains_key(&role)
    }

    pub fn entry(&self, role: Role) -> Result<&RoleEntry, AccessError> {
        self.roles
            .get(&role)
            .ok_or(AccessError::RoleNotInPolicy(role))
    }

    /// Roles missing from the table never get store access.
    pub fn store_access(&self, role: Option<Role>) -> bool {
        role.and_then(|r| self.roles.get(&r))
            .is_some_and(|e| e.store_access)
    }

    pub fn implied_keys(&self, role: Option<Role>) -> BTreeSet<PermissionKey> {
        role.and_then(|r| self.roles.get(&r))
            .map(|e| e.implied.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidc_storage::TrialId;
    use std::io::Write;

    #[test]
    fn test_default_policy_covers_every_role() {
        let policy = RolePolicy::default();
        assert_eq!(policy.version, 1);
        for role in Role::ALL {
            assert!(policy.contains(role), "{} missing", role);
        }
    }

    #[test]
    fn test_download_restricted_roles() {
        let policy = RolePolicy::default();
        assert!(!policy.store_access(Some(Role::NetworkViewer)));
        assert!(!policy.store_access(Some(Role::PactUser)));
        assert!(policy.store_access(Some(Role::CimacUser)));
        assert!(!policy.store_access(None));
    }

    #[test]
    fn test_admin_implies_clinical_data() {
        let policy = RolePolicy::default();
        let keys = policy.implied_keys(Some(Role::Admin));
        let covers_clinical = keys
            .iter()
            .any(|k| k.covers(&TrialId::new("t1"), &UploadType::new("clinical_data")));
        assert!(covers_clinical);

        let biobank = policy.implied_keys(Some(Role::NciBiobankUser));
        assert!(!biobank
            .iter()
            .any(|k| k.covers(&TrialId::new("t1"), &UploadType::new("clinical_data"))));
    }

    #[test]
    fn test_policy_json_roundtrip() {
        let policy = RolePolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"cidc-admin\""));
        assert_eq!(RolePolicy::from_json_str(&json).unwrap(), policy);
    }

    #[test]
    fn test_policy_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"version": 2, "roles": {{"cimac-user": {{"store_access": true, "implied": [{{"trial": "10021", "upload_type": "*"}}]}}}}}}"#
        )
        .unwrap();

        let policy = RolePolicy::from_path(file.path()).unwrap();
        assert_eq!(policy.version, 2);
        assert_eq!(
            policy.implied_keys(Some(Role::CimacUser)),
            BTreeSet::from([PermissionKey::from_db("10021", "*")])
        );
        assert!(matches!(
            policy.entry(Role::Admin),
            Err(AccessError::RoleNotInPolicy(Role::Admin))
        ));
    }

    #[test]
    fn test_invalid_policy_json() {
        assert!(matches!(
            RolePolicy::from_json_str(r#"{"version": 1, "roles": {"wizard": {"store_access": true}}}"#),
            Err(AccessError::Policy(_))
        ));
    }
}
