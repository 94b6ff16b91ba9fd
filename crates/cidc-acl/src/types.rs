use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use cidc_storage::{TrialId, UploadType};
use serde::{Deserialize, Serialize};

/// Object-store member identity, e.g. `user:jane@example.org`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn user(email: &str) -> Self {
        Self(format!("user:{}", email))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The email part of a `user:` member.
    pub fn email(&self) -> Option<&str> {
        self.0.strip_prefix("user:")
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object path prefix a read grant applies to: `<trial_id>/<broad upload type>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclPrefix(pub String);

impl AclPrefix {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Prefix holding the objects of one upload type: `10021/wes` for `wes_bam`.
    pub fn for_upload(trial_id: &TrialId, upload_type: &UploadType) -> Self {
        Self(format!("{}/{}", trial_id.0, upload_type.broad()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AclPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AclOp {
    AddReader,
    RemoveReader,
}

impl AclOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclOp::AddReader => "add_reader",
            AclOp::RemoveReader => "remove_reader",
        }
    }
}

/// One desired ACL mutation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AclChange {
    pub op: AclOp,
    pub principal: Principal,
    pub prefix: AclPrefix,
}

impl AclChange {
    pub fn add(principal: Principal, prefix: AclPrefix) -> Self {
        Self {
            op: AclOp::AddReader,
            principal,
            prefix,
        }
    }

    pub fn remove(principal: Principal, prefix: AclPrefix) -> Self {
        Self {
            op: AclOp::RemoveReader,
            principal,
            prefix,
        }
    }
}

impl std::fmt::Display for AclChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.op.as_str(), self.principal, self.prefix)
    }
}

/// One read grant as the store currently holds it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadGrant {
    pub prefix: AclPrefix,
    /// When the store stops honoring the grant by itself. `None` for grants without expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// The grant is close enough to `expires_at` that it should be written again.
    pub renewal_due: bool,
}

impl ReadGrant {
    pub fn permanent(prefix: AclPrefix) -> Self {
        Self {
            prefix,
            expires_at: None,
            renewal_due: false,
        }
    }
}

/// Everything the store grants one principal. Lapsed grants are never listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrantListing {
    pub reads: Vec<ReadGrant>,
    /// Holds the bucket-level role that allows listing objects.
    pub lister: bool,
}

impl GrantListing {
    pub fn prefixes(&self) -> BTreeSet<AclPrefix> {
        self.reads.iter().map(|g| g.prefix.clone()).collect()
    }

    /// Prefixes readable now whose every grant is about to lapse.
    pub fn renewals_due(&self) -> BTreeSet<AclPrefix> {
        let fresh: BTreeSet<&AclPrefix> = self
            .reads
            .iter()
            .filter(|g| !g.renewal_due)
            .map(|g| &g.prefix)
            .collect();
        self.reads
            .iter()
            .filter(|g| g.renewal_due && !fresh.contains(&g.prefix))
            .map(|g| g.prefix.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_uses_broad_upload_type() {
        let prefix = AclPrefix::for_upload(&TrialId::new("10021"), &UploadType::new("wes_bam"));
        assert_eq!(prefix.as_str(), "10021/wes");
        let prefix = AclPrefix::for_upload(&TrialId::new("10021"), &UploadType::new("olink"));
        assert_eq!(prefix.as_str(), "10021/olink");
    }

    #[test]
    fn test_principal_member_format() {
        let p = Principal::user("jane@example.org");
        assert_eq!(p.as_str(), "user:jane@example.org");
        assert_eq!(p.email(), Some("jane@example.org"));
        assert_eq!(Principal("group:x".into()).email(), None);
    }

    #[test]
    fn test_change_display() {
        let change = AclChange::add(Principal::user("a@b.c"), AclPrefix::new("t1/wes"));
        assert_eq!(change.to_string(), "add_reader user:a@b.c t1/wes");
    }

    #[test]
    fn test_renewal_is_due_only_when_no_fresh_grant_covers_the_prefix() {
        let due = |p: &str| ReadGrant {
            prefix: AclPrefix::new(p),
            expires_at: None,
            renewal_due: true,
        };
        let listing = GrantListing {
            reads: vec![
                due("t1/wes"),
                due("t1/olink"),
                ReadGrant::permanent(AclPrefix::new("t1/olink")),
            ],
            lister: true,
        };
        assert_eq!(listing.renewals_due(), BTreeSet::from([AclPrefix::new("t1/wes")]));
        assert_eq!(listing.prefixes().len(), 2);
    }
}
