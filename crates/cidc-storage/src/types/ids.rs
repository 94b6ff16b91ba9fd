//! Strongly-typed identifiers (avoid mixing strings/UUIDs arbitrarily).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub Uuid);

/// Permission row identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermissionId(pub Uuid);

/// Downloadable file identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub Uuid);

/// Trial identifier (e.g. "10021").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub String);

/// Upload type (assay, manifest or analysis category, e.g. "wes_bam").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadType(pub String);

impl UploadType {
    /// Clinical data is never covered by an upload-type wildcard.
    pub const CLINICAL_DATA: &'static str = "clinical_data";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn is_clinical_data(&self) -> bool {
        self.0 == Self::CLINICAL_DATA
    }

    /// Broad category used in object paths: `wes_bam` -> `wes`, `cytof_analysis` -> `cytof`.
    pub fn broad(&self) -> &str {
        self.0.split('_').next().unwrap_or(&self.0)
    }
}

impl TrialId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for PermissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for UploadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(UserId(uuid).to_string(), uuid.to_string());
    }

    #[test]
    fn test_typed_ids_hash() {
        use std::collections::HashSet;

        let uuid = Uuid::new_v4();
        let mut set = HashSet::new();
        set.insert(UserId(uuid));
        assert!(set.contains(&UserId(uuid)));
    }

    #[test]
    fn test_broad_upload_type() {
        assert_eq!(UploadType::new("wes_bam").broad(), "wes");
        assert_eq!(UploadType::new("cytof_analysis").broad(), "cytof");
        assert_eq!(UploadType::new("olink").broad(), "olink");
        assert_eq!(UploadType::new("clinical_data").broad(), "clinical");
    }

    #[test]
    fn test_clinical_data_detection() {
        assert!(UploadType::new("clinical_data").is_clinical_data());
        assert!(!UploadType::new("wes").is_clinical_data());
    }

    #[test]
    fn test_trial_id_serializes_transparently() {
        let json = serde_json::to_string(&TrialId::new("10021")).unwrap();
        assert_eq!(json, "\"10021\"");
    }
}
