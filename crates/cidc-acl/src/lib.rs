//! Bucket ACL contract for the cidc data bucket.
//!
//! [`BucketAcl`] is the narrow interface to the object store's access lists; backends live in
//! `cidc-acl-memory` and `cidc-acl-gcs`. [`BucketAclAdapter`] wraps a backend with
//! deduplication, batching, bounded concurrency and retry of transient failures.

mod adapter;
mod retry;
mod types;

pub use adapter::*;
pub use retry::*;
pub use types::*;

use std::collections::BTreeSet;

use thiserror::Error;

/// Failure taxonomy of the object store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AclError {
    /// Throttling, timeouts, 5xx, concurrent policy edits. Safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),
    /// The engine's own credentials were rejected. Never retried.
    #[error("permission denied by store: {0}")]
    PermissionDenied(String),
    /// Bucket or object path does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
}

impl AclError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AclError::Transient(_))
    }
}

/// Read-grant operations against the data bucket.
///
/// Implementations must be idempotent: adding an existing reader and removing an absent one
/// both succeed.
#[async_trait::async_trait]
pub trait BucketAcl: Send + Sync {
    /// Grant `principal` read access to every object under `prefix`.
    async fn add_reader(&self, principal: &Principal, prefix: &AclPrefix) -> Result<(), AclError>;

    /// Remove `principal`'s read access to `prefix`.
    async fn remove_reader(
        &self,
        principal: &Principal,
        prefix: &AclPrefix,
    ) -> Result<(), AclError>;

    /// Apply several changes, returning one result per change in input order.
    ///
    /// The default issues one call per change. Backends that can apply a batch in a single
    /// round-trip override this.
    async fn apply_batch(&self, changes: &[AclChange]) -> Vec<Result<(), AclError>> {
        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            let result = match change.op {
                AclOp::AddReader => self.add_reader(&change.principal, &change.prefix).await,
                AclOp::RemoveReader => self.remove_reader(&change.principal, &change.prefix).await,
            };
            results.push(result);
        }
        results
    }

    /// Read grants and lister role `principal` currently holds.
    async fn list_grants(&self, principal: &Principal) -> Result<GrantListing, AclError>;

    /// Prefixes `principal` can currently read.
    async fn list_prefixes(&self, principal: &Principal) -> Result<BTreeSet<AclPrefix>, AclError> {
        Ok(self.list_grants(principal).await?.prefixes())
    }

    /// Grant or withdraw the bucket-level role that lets `principal` list object names.
    /// Idempotent like the reader operations.
    async fn set_lister(&self, principal: &Principal, enabled: bool) -> Result<(), AclError>;

    /// Largest batch accepted by [`BucketAcl::apply_batch`].
    fn max_batch_size(&self) -> usize {
        100
    }
}
