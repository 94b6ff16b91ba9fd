//! Bucket IAM policy (version 3) and conditional read bindings.
//!
//! Each read grant is its own binding with a single member and a CEL condition
//! `resource.name.startsWith("projects/_/buckets/<bucket>/objects/<prefix>")`, optionally
//! combined with a `request.time` expiry. A binding past its expiry grants nothing and is
//! replaced when the grant is added again. Listing object names is a separate unconditional
//! binding shared by every member holding the lister role.

use chrono::{DateTime, Duration, Utc};
use cidc_acl::{AclChange, AclOp, AclPrefix, Principal, ReadGrant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const POLICY_VERSION: u32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Fields this crate does not interpret (`kind`, `resourceId`) are written back as read.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub expression: String,
}

/// How read bindings are written for one bucket.
#[derive(Clone, Debug)]
pub struct BindingTemplate {
    pub bucket: String,
    pub role: String,
    /// Days until a binding lapses on its own; `None` for no expiry clause.
    pub ttl_days: Option<u32>,
    /// A binding this close to its expiry is rewritten by the next add.
    pub renew_within_days: u32,
    /// Bucket-level role that allows listing object names.
    pub lister_role: String,
}

const EXPIRY_MARKER: &str = "request.time < timestamp(\"";

impl BindingTemplate {
    fn object_root(&self) -> String {
        format!("projects/_/buckets/{}/objects/", self.bucket)
    }

    /// `resource.name.startsWith(...)` clause for `prefix`.
    pub fn prefix_expression(&self, prefix: &AclPrefix) -> String {
        format!(
            "resource.name.startsWith(\"{}{}\")",
            self.object_root(),
            prefix
        )
    }

    pub fn ttl_expression(days: u32, now: DateTime<Utc>) -> String {
        let until = (now + Duration::days(i64::from(days))).date_naive();
        format!("request.time < timestamp(\"{}T00:00:00Z\")", until.format("%Y-%m-%d"))
    }

    pub fn binding_for(&self, principal: &Principal, prefix: &AclPrefix, now: DateTime<Utc>) -> Binding {
        let mut expression = self.prefix_expression(prefix);
        if let Some(days) = self.ttl_days {
            expression = format!("{} && {}", expression, Self::ttl_expression(days, now));
        }
        let who = principal.email().unwrap_or(principal.as_str());
        Binding {
            role: self.role.clone(),
            members: vec![principal.0.clone()],
            condition: Some(Condition {
                title: format!("Download access on {}* for {}", prefix, who),
                description: Some(format!("Managed by cidc-access at {}", now.to_rfc3339())),
                expression,
            }),
        }
    }

    /// Expiry written into a binding's condition, if any.
    pub fn expires_at(binding: &Binding) -> Option<DateTime<Utc>> {
        let expression = &binding.condition.as_ref()?.expression;
        let start = expression.find(EXPIRY_MARKER)? + EXPIRY_MARKER.len();
        let rest = &expression[start..];
        let end = rest.find('"')?;
        DateTime::parse_from_rfc3339(&rest[..end])
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn is_live(binding: &Binding, now: DateTime<Utc>) -> bool {
        Self::expires_at(binding).map_or(true, |until| until > now)
    }

    fn renewal_due(&self, binding: &Binding, now: DateTime<Utc>) -> bool {
        let window = Duration::days(i64::from(self.renew_within_days));
        Self::expires_at(binding).is_some_and(|until| until <= now + window)
    }

    fn is_read_binding(&self, binding: &Binding, principal: &Principal, prefix: &AclPrefix) -> bool {
        let expression = self.prefix_expression(prefix);
        binding.role == self.role
            && binding.members.len() == 1
            && binding.members[0] == principal.0
            && binding
                .condition
                .as_ref()
                .is_some_and(|c| c.expression.contains(&expression))
    }

    /// Prefix named by a read binding's condition, if it is one of ours.
    pub fn prefix_of(&self, binding: &Binding) -> Option<AclPrefix> {
        if binding.role != self.role {
            return None;
        }
        let expression = &binding.condition.as_ref()?.expression;
        let marker = format!("resource.name.startsWith(\"{}", self.object_root());
        let start = expression.find(&marker)? + marker.len();
        let rest = &expression[start..];
        let end = rest.find("\")")?;
        Some(AclPrefix::new(&rest[..end]))
    }

    /// Apply one change. Returns whether the policy was modified.
    ///
    /// An add is a no-op only while a matching binding is live and outside the renewal
    /// window; otherwise the stale matches are dropped and a fresh binding is written.
    pub fn apply(&self, policy: &mut Policy, change: &AclChange, now: DateTime<Utc>) -> bool {
        match change.op {
            AclOp::AddReader => {
                let current = policy.bindings.iter().any(|b| {
                    self.is_read_binding(b, &change.principal, &change.prefix)
                        && Self::is_live(b, now)
                        && !self.renewal_due(b, now)
                });
                if current {
                    return false;
                }
                policy
                    .bindings
                    .retain(|b| !self.is_read_binding(b, &change.principal, &change.prefix));
                policy
                    .bindings
                    .push(self.binding_for(&change.principal, &change.prefix, now));
                true
            }
            AclOp::RemoveReader => {
                let before = policy.bindings.len();
                policy
                    .bindings
                    .retain(|b| !self.is_read_binding(b, &change.principal, &change.prefix));
                policy.bindings.len() != before
            }
        }
    }

    /// Read bindings of `principal` that are still honored at `now`.
    pub fn read_grants(
        &self,
        policy: &Policy,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Vec<ReadGrant> {
        policy
            .bindings
            .iter()
            .filter(|b| b.members.iter().any(|m| *m == principal.0))
            .filter(|b| Self::is_live(b, now))
            .filter_map(|b| {
                Some(ReadGrant {
                    prefix: self.prefix_of(b)?,
                    expires_at: Self::expires_at(b),
                    renewal_due: self.renewal_due(b, now),
                })
            })
            .collect()
    }

    /// Prefixes `principal` can read at `now`.
    pub fn readable_prefixes(
        &self,
        policy: &Policy,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> BTreeSet<AclPrefix> {
        self.read_grants(policy, principal, now)
            .into_iter()
            .map(|g| g.prefix)
            .collect()
    }

    fn is_lister_binding(&self, binding: &Binding) -> bool {
        binding.role == self.lister_role && binding.condition.is_none()
    }

    pub fn is_lister(&self, policy: &Policy, principal: &Principal) -> bool {
        policy
            .bindings
            .iter()
            .filter(|b| self.is_lister_binding(b))
            .any(|b| b.members.contains(&principal.0))
    }

    /// Add or remove `principal` on the lister binding. Returns whether the policy was modified.
    pub fn set_lister(&self, policy: &mut Policy, principal: &Principal, enabled: bool) -> bool {
        if enabled == self.is_lister(policy, principal) {
            return false;
        }
        if enabled {
            match policy.bindings.iter_mut().find(|b| self.is_lister_binding(b)) {
                Some(binding) => binding.members.push(principal.0.clone()),
                None => policy.bindings.push(Binding {
                    role: self.lister_role.clone(),
                    members: vec![principal.0.clone()],
                    condition: None,
                }),
            }
        } else {
            for binding in policy.bindings.iter_mut() {
                if self.is_lister_binding(binding) {
                    binding.members.retain(|m| *m != principal.0);
                }
            }
            policy
                .bindings
                .retain(|b| !(self.is_lister_binding(b) && b.members.is_empty()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template(ttl_days: Option<u32>) -> BindingTemplate {
        BindingTemplate {
            bucket: "cidc-data".to_string(),
            role: "roles/storage.objectViewer".to_string(),
            ttl_days,
            renew_within_days: 7,
            lister_role: "roles/storage.legacyBucketReader".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap()
    }

    fn alice() -> Principal {
        Principal::user("alice@example.com")
    }

    #[test]
    fn test_binding_expression_with_ttl() {
        let binding = template(Some(60)).binding_for(&alice(), &AclPrefix::new("10021/wes"), now());
        let cond = binding.condition.unwrap();
        assert_eq!(
            cond.expression,
            "resource.name.startsWith(\"projects/_/buckets/cidc-data/objects/10021/wes\") \
             && request.time < timestamp(\"2024-03-15T00:00:00Z\")"
        );
        assert_eq!(cond.title, "Download access on 10021/wes* for alice@example.com");
        assert_eq!(binding.members, vec!["user:alice@example.com".to_string()]);
    }

    #[test]
    fn test_add_is_idempotent_and_remove_only_matches_exact_prefix() {
        let t = template(None);
        let mut policy = Policy::default();
        let wes = AclChange::add(alice(), AclPrefix::new("t1/wes"));

        assert!(t.apply(&mut policy, &wes, now()));
        assert!(!t.apply(&mut policy, &wes, now()));
        assert!(t.apply(&mut policy, &AclChange::add(alice(), AclPrefix::new("t1/wesx")), now()));
        assert_eq!(policy.bindings.len(), 2);

        assert!(t.apply(&mut policy, &AclChange::remove(alice(), AclPrefix::new("t1/wes")), now()));
        assert_eq!(
            t.readable_prefixes(&policy, &alice(), now()),
            BTreeSet::from([AclPrefix::new("t1/wesx")])
        );
        assert!(!t.apply(&mut policy, &AclChange::remove(alice(), AclPrefix::new("t1/wes")), now()));
    }

    #[test]
    fn test_foreign_bindings_are_preserved() {
        let t = template(Some(60));
        let mut policy: Policy = serde_json::from_value(serde_json::json!({
            "kind": "storage#policy",
            "resourceId": "projects/_/buckets/cidc-data",
            "version": 3,
            "etag": "CAE=",
            "bindings": [
                {"role": "roles/storage.legacyBucketOwner", "members": ["projectOwner:cidc"]}
            ]
        }))
        .unwrap();

        t.apply(&mut policy, &AclChange::add(alice(), AclPrefix::new("t1/olink")), now());
        t.apply(&mut policy, &AclChange::remove(alice(), AclPrefix::new("t1/olink")), now());

        assert_eq!(policy.bindings.len(), 1);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["kind"], "storage#policy");
        assert_eq!(json["etag"], "CAE=");
    }

    #[test]
    fn test_readable_prefixes_ignores_other_members_and_roles() {
        let t = template(Some(60));
        let mut policy = Policy::default();
        t.apply(&mut policy, &AclChange::add(alice(), AclPrefix::new("t1/wes")), now());
        t.apply(
            &mut policy,
            &AclChange::add(Principal::user("bob@example.com"), AclPrefix::new("t2/wes")),
            now(),
        );
        let mut other_role = t.binding_for(&alice(), &AclPrefix::new("t3/wes"), now());
        other_role.role = "roles/storage.objectAdmin".to_string();
        policy.bindings.push(other_role);

        assert_eq!(
            t.readable_prefixes(&policy, &alice(), now()),
            BTreeSet::from([AclPrefix::new("t1/wes")])
        );
    }

    #[test]
    fn test_expiry_is_parsed_from_condition() {
        let binding = template(Some(60)).binding_for(&alice(), &AclPrefix::new("t1/wes"), now());
        assert_eq!(
            BindingTemplate::expires_at(&binding),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap())
        );
        let permanent = template(None).binding_for(&alice(), &AclPrefix::new("t1/wes"), now());
        assert_eq!(BindingTemplate::expires_at(&permanent), None);
    }

    #[test]
    fn test_lapsed_binding_is_not_listed_and_is_replaced_on_add() {
        let t = template(Some(60));
        let mut policy = Policy::default();
        let wes = AclChange::add(alice(), AclPrefix::new("t1/wes"));
        assert!(t.apply(&mut policy, &wes, now()));

        let later = now() + Duration::days(90);
        assert!(t.readable_prefixes(&policy, &alice(), later).is_empty());

        assert!(t.apply(&mut policy, &wes, later));
        assert_eq!(policy.bindings.len(), 1);
        assert_eq!(
            BindingTemplate::expires_at(&policy.bindings[0]),
            Some(Utc.with_ymd_and_hms(2024, 6, 13, 0, 0, 0).unwrap())
        );
        assert_eq!(
            t.readable_prefixes(&policy, &alice(), later),
            BTreeSet::from([AclPrefix::new("t1/wes")])
        );
    }

    #[test]
    fn test_binding_near_expiry_is_due_for_renewal() {
        let t = template(Some(60));
        let mut policy = Policy::default();
        let wes = AclChange::add(alice(), AclPrefix::new("t1/wes"));
        t.apply(&mut policy, &wes, now());

        let early = now() + Duration::days(30);
        assert!(!t.read_grants(&policy, &alice(), early)[0].renewal_due);
        assert!(!t.apply(&mut policy, &wes, early));

        let late = now() + Duration::days(55);
        let grants = t.read_grants(&policy, &alice(), late);
        assert_eq!(grants.len(), 1);
        assert!(grants[0].renewal_due);
        assert!(t.apply(&mut policy, &wes, late));
        assert!(!t.read_grants(&policy, &alice(), late)[0].renewal_due);
        assert_eq!(policy.bindings.len(), 1);
    }

    #[test]
    fn test_lister_binding_is_shared_and_dropped_when_empty() {
        let t = template(None);
        let bob = Principal::user("bob@example.com");
        let mut policy = Policy::default();

        assert!(t.set_lister(&mut policy, &alice(), true));
        assert!(!t.set_lister(&mut policy, &alice(), true));
        assert!(t.set_lister(&mut policy, &bob, true));
        assert_eq!(policy.bindings.len(), 1);
        assert_eq!(policy.bindings[0].members.len(), 2);
        assert!(policy.bindings[0].condition.is_none());

        assert!(t.set_lister(&mut policy, &alice(), false));
        assert!(!t.is_lister(&policy, &alice()));
        assert!(t.is_lister(&policy, &bob));
        assert!(t.set_lister(&mut policy, &bob, false));
        assert!(policy.bindings.is_empty());
        assert!(!t.set_lister(&mut policy, &bob, false));
    }
}
