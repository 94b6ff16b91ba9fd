//! Downloadable file and trial types.

use chrono::{DateTime, Utc};

use super::{FileId, TrialId, UploadType};

/// A result file in the data bucket.
#[derive(Clone, Debug)]
pub struct DownloadableFile {
    pub id: FileId,
    pub trial_id: TrialId,
    pub upload_type: UploadType,
    pub object_url: String,
    pub md5_hash: Option<String>,
    pub file_size_bytes: i64,
    pub facet_group: String,
    pub visible: bool,
    pub uploaded_at: DateTime<Utc>,
}

/// Parameters for registering a completed upload
#[derive(Clone, Debug)]
pub struct NewDownloadableFile {
    pub trial_id: TrialId,
    pub upload_type: UploadType,
    pub object_url: String,
    pub md5_hash: Option<String>,
    pub file_size_bytes: i64,
    pub facet_group: String,
}

/// Narrowing filter for file listings; `None` matches everything.
#[derive(Clone, Debug, Default)]
pub struct FileFilter {
    pub trial_id: Option<TrialId>,
    pub upload_type: Option<UploadType>,
    pub visible_only: bool,
}

/// A trial and the upload types present in its files.
#[derive(Clone, Debug)]
pub struct Trial {
    pub trial_id: TrialId,
    pub upload_types: Vec<UploadType>,
    pub created_at: DateTime<Utc>,
}
