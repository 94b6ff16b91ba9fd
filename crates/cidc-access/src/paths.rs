//! Mapping from ledger keys to object-store principals and prefixes.

use std::collections::BTreeSet;

use cidc_acl::{AclPrefix, Principal};
use cidc_storage::{PermissionKey, Trial, User};

pub fn principal_for(user: &User) -> Principal {
    Principal::user(&user.email)
}

/// Prefixes a key resolves to given the trials and upload types currently in the catalog.
///
/// Wildcards expand only to existing paths. Files registered later are picked up by
/// extending the grant at registration time.
pub fn prefixes_for_key(key: &PermissionKey, trials: &[Trial]) -> BTreeSet<AclPrefix> {
    let mut prefixes = BTreeSet::new();
    for trial in trials {
        for upload_type in &trial.upload_types {
            if key.covers(&trial.trial_id, upload_type) {
                prefixes.insert(AclPrefix::for_upload(&trial.trial_id, upload_type));
            }
        }
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cidc_storage::{TrialId, UploadType};

    fn catalog() -> Vec<Trial> {
        vec![
            Trial {
                trial_id: TrialId::new("10021"),
                upload_types: vec![
                    UploadType::new("clinical_data"),
                    UploadType::new("olink"),
                    UploadType::new("wes_bam"),
                    UploadType::new("wes_analysis"),
                ],
                created_at: Utc::now(),
            },
            Trial {
                trial_id: TrialId::new("10026"),
                upload_types: vec![UploadType::new("cytof")],
                created_at: Utc::now(),
            },
        ]
    }

    #[test]
    fn test_exact_key_resolves_to_broad_prefix() {
        let key = PermissionKey::from_db("10021", "wes_bam");
        let prefixes = prefixes_for_key(&key, &catalog());
        assert_eq!(prefixes, BTreeSet::from([AclPrefix::new("10021/wes")]));
    }

    #[test]
    fn test_upload_wildcard_skips_clinical_data() {
        let key = PermissionKey::from_db("10021", "*");
        let prefixes = prefixes_for_key(&key, &catalog());
        assert_eq!(
            prefixes,
            BTreeSet::from([AclPrefix::new("10021/olink"), AclPrefix::new("10021/wes")])
        );
    }

    #[test]
    fn test_trial_wildcard_spans_trials() {
        let key = PermissionKey::from_db("*", "cytof");
        assert_eq!(
            prefixes_for_key(&key, &catalog()),
            BTreeSet::from([AclPrefix::new("10026/cytof")])
        );
        let clinical = PermissionKey::from_db("*", "clinical_data");
        assert_eq!(
            prefixes_for_key(&clinical, &catalog()),
            BTreeSet::from([AclPrefix::new("10021/clinical")])
        );
    }

    #[test]
    fn test_unknown_trial_resolves_to_nothing() {
        let key = PermissionKey::from_db("99999", "*");
        assert!(prefixes_for_key(&key, &catalog()).is_empty());
    }
}
