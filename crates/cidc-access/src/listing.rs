//! Read-side queries answered from the ledger alone, never from the object store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use cidc_storage::{
    DownloadableFile, Ledger, Permission, PermissionFilter, StoreError, TrialId, UploadType,
    User, UserId,
};

use crate::clock::Clock;
use crate::AccessError;

pub struct ListingService {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
}

impl ListingService {
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// Visible files covered by the user's active permissions. Empty unless approved.
    pub async fn files_visible_to(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<DownloadableFile>, AccessError> {
        let user = match self.ledger.get_user(user_id).await {
            Err(StoreError::NotFound) => return Err(AccessError::UserNotFound(user_id.clone())),
            other => other?,
        };
        if !user.is_approved() {
            return Ok(Vec::new());
        }

        let rows = self
            .ledger
            .list_active_for_user(user_id, self.clock.now())
            .await?;
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for row in &rows {
            for file in self.ledger.list_files(&row.key.file_filter(true)).await? {
                if row.key.covers(&file.trial_id, &file.upload_type) && seen.insert(file.id.clone())
                {
                    files.push(file);
                }
            }
        }
        files.sort_by(|a, b| {
            (&a.trial_id, &a.upload_type, &a.object_url).cmp(&(
                &b.trial_id,
                &b.upload_type,
                &b.object_url,
            ))
        });
        Ok(files)
    }

    /// Approved users holding an active permission that covers the resource, by email.
    pub async fn users_with_access(
        &self,
        trial_id: &TrialId,
        upload_type: &UploadType,
    ) -> Result<Vec<User>, AccessError> {
        let rows = self
            .ledger
            .list_active_for_resource(trial_id, upload_type, self.clock.now())
            .await?;
        let mut users = BTreeMap::new();
        for row in rows.iter().filter(|r| r.key.covers(trial_id, upload_type)) {
            if users.contains_key(&row.user_id) {
                continue;
            }
            let user = self.ledger.get_user(&row.user_id).await?;
            if user.is_approved() {
                users.insert(row.user_id.clone(), user);
            }
        }
        let mut users: Vec<User> = users.into_values().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    pub async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, AccessError> {
        let now = self.clock.now();
        let mut rows = self.ledger.list_permissions(filter).await?;
        // Rows past their expiry read as inactive before the sweep marks them.
        if !filter.include_inactive {
            rows.retain(|r| r.is_effective(now));
        }
        Ok(rows)
    }
}
