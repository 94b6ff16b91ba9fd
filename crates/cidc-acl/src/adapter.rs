use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, warn};

use crate::{
    AclChange, AclError, AclPrefix, BackoffPolicy, BucketAcl, GrantListing, Principal, RetryPolicy,
};

/// Batching and concurrency limits for [`BucketAclAdapter`].
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Final outcome of one change after retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    /// The store reported the path missing; nothing to enforce.
    Skipped,
    /// Retry budget exhausted; the change must be retried later.
    Pending(String),
}

/// Per-change outcomes of [`BucketAclAdapter::apply`].
#[derive(Clone, Debug, Default)]
pub struct AclReport {
    pub outcomes: Vec<(AclChange, ChangeOutcome)>,
}

impl AclReport {
    /// Nothing left pending.
    pub fn all_settled(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn applied_count(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Applied))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Skipped))
    }

    pub fn pending_count(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Pending(_)))
    }

    pub fn pending_prefixes(&self) -> BTreeSet<AclPrefix> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ChangeOutcome::Pending(_)))
            .map(|(c, _)| c.prefix.clone())
            .collect()
    }

    pub fn outcome_for(&self, change: &AclChange) -> Option<&ChangeOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| c == change)
            .map(|(_, o)| o)
    }

    fn count(&self, pred: impl Fn(&ChangeOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

struct ChunkResult {
    outcomes: Vec<(AclChange, ChangeOutcome)>,
    fatal: Option<AclError>,
}

/// Applies ACL changes to a [`BucketAcl`] backend with retries and bounded concurrency.
#[derive(Clone)]
pub struct BucketAclAdapter {
    acl: Arc<dyn BucketAcl>,
    config: AdapterConfig,
}

impl BucketAclAdapter {
    pub fn new(acl: Arc<dyn BucketAcl>, config: AdapterConfig) -> Self {
        Self { acl, config }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Apply `changes`, deduplicated and split into batches.
    ///
    /// Transient failures are retried with backoff and reported `Pending` once the budget is
    /// exhausted. A `PermissionDenied` from any batch is returned as `Err` after the other
    /// batches have finished.
    pub async fn apply(&self, changes: Vec<AclChange>) -> Result<AclReport, AclError> {
        let mut seen = HashSet::new();
        let unique: Vec<AclChange> = changes
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        if unique.is_empty() {
            return Ok(AclReport::default());
        }

        let batch_size = self
            .config
            .batch_size
            .min(self.acl.max_batch_size())
            .max(1);
        let chunks: Vec<Vec<AclChange>> = unique.chunks(batch_size).map(|c| c.to_vec()).collect();
        debug!(
            changes = unique.len(),
            batches = chunks.len(),
            "applying ACL changes"
        );

        let results: Vec<ChunkResult> = stream::iter(chunks)
            .map(|chunk| self.apply_chunk(chunk))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = AclReport::default();
        let mut fatal = None;
        for result in results {
            report.outcomes.extend(result.outcomes);
            if fatal.is_none() {
                fatal = result.fatal;
            }
        }

        match fatal {
            Some(err) => {
                error!(error = %err, "object store rejected engine credentials");
                Err(err)
            }
            None => Ok(report),
        }
    }

    async fn apply_chunk(&self, chunk: Vec<AclChange>) -> ChunkResult {
        let policy = &self.config.retry;
        let mut outcomes = Vec::with_capacity(chunk.len());
        let mut remaining = chunk;
        let mut last_error: Option<AclError> = None;
        let mut attempt = 0;

        while !remaining.is_empty() && attempt < policy.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            attempt += 1;

            let results = self.acl.apply_batch(&remaining).await;
            let mut retry = Vec::new();
            for (i, change) in remaining.into_iter().enumerate() {
                let result = results.get(i).cloned().unwrap_or_else(|| {
                    Err(AclError::Transient("missing result for change".to_string()))
                });
                match result {
                    Ok(()) => outcomes.push((change, ChangeOutcome::Applied)),
                    Err(AclError::ResourceNotFound(msg)) => {
                        warn!(change = %change, reason = %msg, "ACL target not found; skipping");
                        outcomes.push((change, ChangeOutcome::Skipped));
                    }
                    Err(err @ AclError::PermissionDenied(_)) => {
                        outcomes.push((change, ChangeOutcome::Pending(err.to_string())));
                        last_error = Some(err);
                    }
                    Err(err) => {
                        debug!(change = %change, attempt, error = %err, "transient ACL failure");
                        retry.push(change);
                        if !matches!(last_error, Some(AclError::PermissionDenied(_))) {
                            last_error = Some(err);
                        }
                    }
                }
            }
            remaining = retry;

            if let Some(err @ AclError::PermissionDenied(_)) = &last_error {
                let reason = err.to_string();
                outcomes.extend(
                    remaining
                        .drain(..)
                        .map(|c| (c, ChangeOutcome::Pending(reason.clone()))),
                );
                return ChunkResult {
                    outcomes,
                    fatal: Some(err.clone()),
                };
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retry budget exhausted".to_string());
        for change in remaining {
            warn!(change = %change, attempts = attempt, reason = %reason, "ACL change left pending");
            outcomes.push((change, ChangeOutcome::Pending(reason.clone())));
        }

        ChunkResult {
            outcomes,
            fatal: None,
        }
    }

    /// Current grants of `principal`, retrying transient failures.
    pub async fn list_grants(&self, principal: &Principal) -> Result<GrantListing, AclError> {
        self.retrying("list", principal, || self.acl.list_grants(principal))
            .await
    }

    /// Current read grants of `principal`, retrying transient failures.
    pub async fn list_prefixes(
        &self,
        principal: &Principal,
    ) -> Result<BTreeSet<AclPrefix>, AclError> {
        Ok(self.list_grants(principal).await?.prefixes())
    }

    /// Grant or withdraw the bucket listing role. Transient failures that outlast the retry
    /// budget come back as `Pending`; `PermissionDenied` is returned as `Err`.
    pub async fn set_lister(
        &self,
        principal: &Principal,
        enabled: bool,
    ) -> Result<ChangeOutcome, AclError> {
        match self
            .retrying("set_lister", principal, || {
                self.acl.set_lister(principal, enabled)
            })
            .await
        {
            Ok(()) => Ok(ChangeOutcome::Applied),
            Err(AclError::ResourceNotFound(msg)) => {
                warn!(principal = %principal, reason = %msg, "bucket not found; lister role skipped");
                Ok(ChangeOutcome::Skipped)
            }
            Err(err @ AclError::Transient(_)) => {
                warn!(principal = %principal, enabled, error = %err, "lister role change left pending");
                Ok(ChangeOutcome::Pending(err.to_string()))
            }
            Err(err) => {
                error!(error = %err, "object store rejected engine credentials");
                Err(err)
            }
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        what: &'static str,
        principal: &Principal,
        mut call: F,
    ) -> Result<T, AclError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AclError>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            attempt += 1;
            match call().await {
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    debug!(principal = %principal, attempt, op = what, error = %err, "retrying ACL call");
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadGrant;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted backend: fails a prefix with the queued errors before succeeding.
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<HashMap<String, Vec<AclError>>>,
        calls: Mutex<Vec<AclChange>>,
        batch_calls: Mutex<usize>,
        lister_calls: Mutex<usize>,
        max_batch: usize,
    }

    impl Scripted {
        fn with_batch(max_batch: usize) -> Self {
            Self {
                max_batch,
                ..Default::default()
            }
        }

        fn fail(&self, prefix: &str, errors: Vec<AclError>) {
            self.failures
                .lock()
                .unwrap()
                .insert(prefix.to_string(), errors);
        }

        fn next(&self, change: &AclChange) -> Result<(), AclError> {
            self.calls.lock().unwrap().push(change.clone());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(change.prefix.as_str()) {
                Some(errors) if !errors.is_empty() => Err(errors.remove(0)),
                _ => Ok(()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BucketAcl for Scripted {
        async fn add_reader(&self, p: &Principal, prefix: &AclPrefix) -> Result<(), AclError> {
            self.next(&AclChange::add(p.clone(), prefix.clone()))
        }

        async fn remove_reader(&self, p: &Principal, prefix: &AclPrefix) -> Result<(), AclError> {
            self.next(&AclChange::remove(p.clone(), prefix.clone()))
        }

        async fn apply_batch(&self, changes: &[AclChange]) -> Vec<Result<(), AclError>> {
            *self.batch_calls.lock().unwrap() += 1;
            changes.iter().map(|c| self.next(c)).collect()
        }

        async fn list_grants(&self, _p: &Principal) -> Result<GrantListing, AclError> {
            match self.failures.lock().unwrap().get_mut("list") {
                Some(errors) if !errors.is_empty() => Err(errors.remove(0)),
                _ => Ok(GrantListing {
                    reads: vec![ReadGrant::permanent(AclPrefix::new("t1/wes"))],
                    lister: true,
                }),
            }
        }

        async fn set_lister(&self, _p: &Principal, _enabled: bool) -> Result<(), AclError> {
            *self.lister_calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().get_mut("lister") {
                Some(errors) if !errors.is_empty() => Err(errors.remove(0)),
                _ => Ok(()),
            }
        }

        fn max_batch_size(&self) -> usize {
            self.max_batch
        }
    }

    fn fast_retry(max_attempts: usize) -> AdapterConfig {
        AdapterConfig {
            batch_size: 10,
            concurrency: 2,
            retry: RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    fn add(prefix: &str) -> AclChange {
        AclChange::add(Principal::user("a@example.com"), AclPrefix::new(prefix))
    }

    #[tokio::test]
    async fn test_duplicates_are_applied_once() {
        let backend = Arc::new(Scripted::with_batch(100));
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));

        let report = adapter
            .apply(vec![add("t1/wes"), add("t1/wes"), add("t1/olink")])
            .await
            .unwrap();
        assert_eq!(report.applied_count(), 2);
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batches_respect_backend_limit() {
        let backend = Arc::new(Scripted::with_batch(2));
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(1));

        let changes = (0..5).map(|i| add(&format!("t{}/wes", i))).collect();
        let report = adapter.apply(changes).await.unwrap();
        assert_eq!(report.applied_count(), 5);
        assert_eq!(*backend.batch_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail(
            "t1/wes",
            vec![AclError::Transient("429".into()), AclError::Transient("503".into())],
        );
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));

        let report = adapter.apply(vec![add("t1/wes")]).await.unwrap();
        assert!(report.all_settled());
        assert_eq!(backend.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_change_pending_without_aborting_siblings() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail("t1/wes", vec![AclError::Transient("503".into()); 5]);
        let adapter = BucketAclAdapter::new(backend, fast_retry(2));

        let report = adapter
            .apply(vec![add("t1/wes"), add("t1/olink")])
            .await
            .unwrap();
        assert!(!report.all_settled());
        assert_eq!(report.applied_count(), 1);
        assert_eq!(
            report.pending_prefixes(),
            BTreeSet::from([AclPrefix::new("t1/wes")])
        );
        assert!(matches!(
            report.outcome_for(&add("t1/wes")),
            Some(ChangeOutcome::Pending(_))
        ));
    }

    #[tokio::test]
    async fn test_not_found_is_skipped() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail("t9/wes", vec![AclError::ResourceNotFound("no bucket".into())]);
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));

        let report = adapter.apply(vec![add("t9/wes")]).await.unwrap();
        assert_eq!(report.skipped_count(), 1);
        assert!(report.all_settled());
        assert_eq!(backend.calls.lock().unwrap().len(), 1, "not retried");
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal_after_siblings_finish() {
        let backend = Arc::new(Scripted::with_batch(1));
        backend.fail("t1/wes", vec![AclError::PermissionDenied("403".into())]);
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));

        let err = adapter
            .apply(vec![add("t1/wes"), add("t1/olink"), add("t2/wes")])
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::PermissionDenied(_)));
        assert_eq!(backend.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_prefixes_retries_transient() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail("list", vec![AclError::Transient("timeout".into())]);
        let adapter = BucketAclAdapter::new(backend, fast_retry(2));

        let prefixes = adapter
            .list_prefixes(&Principal::user("a@example.com"))
            .await
            .unwrap();
        assert!(prefixes.contains(&AclPrefix::new("t1/wes")));
    }

    #[tokio::test]
    async fn test_lister_change_retries_then_reports_pending() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail("lister", vec![AclError::Transient("409".into()); 5]);
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(2));

        let outcome = adapter
            .set_lister(&Principal::user("a@example.com"), true)
            .await
            .unwrap();
        assert!(matches!(outcome, ChangeOutcome::Pending(_)));
        assert_eq!(*backend.lister_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lister_change_denied_is_fatal() {
        let backend = Arc::new(Scripted::with_batch(100));
        backend.fail("lister", vec![AclError::PermissionDenied("403".into())]);
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));

        let err = adapter
            .set_lister(&Principal::user("a@example.com"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::PermissionDenied(_)));
        assert_eq!(*backend.lister_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let backend = Arc::new(Scripted::with_batch(100));
        let adapter = BucketAclAdapter::new(backend.clone(), fast_retry(3));
        let report = adapter.apply(Vec::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(*backend.batch_calls.lock().unwrap(), 0);
    }
}
