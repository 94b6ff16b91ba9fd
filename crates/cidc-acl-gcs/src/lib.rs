//! Google Cloud Storage backend for [`cidc_acl::BucketAcl`].
//!
//! Read grants are conditional IAM bindings on the data bucket's policy. Every mutation is a
//! read-modify-write of the whole policy guarded by its etag, so a batch costs one round-trip
//! pair and a concurrent edit surfaces as a retryable 412.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidc_acl::{AclChange, AclError, AclPrefix, BucketAcl, GrantListing, Principal};
use reqwest::StatusCode;
use tracing::debug;

pub mod policy;

use policy::{BindingTemplate, Policy, POLICY_VERSION};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_READ_ROLE: &str = "roles/storage.objectViewer";
pub const DEFAULT_LISTER_ROLE: &str = "roles/storage.legacyBucketReader";
pub const DEFAULT_RENEW_WITHIN_DAYS: u32 = 7;

#[derive(Clone, Debug)]
pub struct GcsConfig {
    pub bucket: String,
    /// Base URL of the JSON API; overridable for emulators and tests.
    pub endpoint: String,
    pub access_token: Option<String>,
    pub read_role: String,
    /// Role granted without condition to every user holding at least one read grant.
    pub lister_role: String,
    pub ttl_days: Option<u32>,
    pub renew_within_days: u32,
    pub max_batch: usize,
    pub request_timeout: Duration,
}

impl GcsConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            access_token: None,
            read_role: DEFAULT_READ_ROLE.to_string(),
            lister_role: DEFAULT_LISTER_ROLE.to_string(),
            ttl_days: None,
            renew_within_days: DEFAULT_RENEW_WITHIN_DAYS,
            max_batch: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct GcsBucketAcl {
    client: reqwest::Client,
    config: GcsConfig,
    template: BindingTemplate,
}

/// Map an HTTP failure onto the store error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> AclError {
    let msg = format!("{}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AclError::PermissionDenied(msg),
        StatusCode::NOT_FOUND => AclError::ResourceNotFound(msg),
        // 412/409 are lost etag races; other statuses are retried and left pending.
        _ => AclError::Transient(msg),
    }
}

fn transport(e: reqwest::Error) -> AclError {
    AclError::Transient(e.to_string())
}

impl GcsBucketAcl {
    pub fn new(config: GcsConfig) -> Result<Self, AclError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(transport)?;
        let template = BindingTemplate {
            bucket: config.bucket.clone(),
            role: config.read_role.clone(),
            ttl_days: config.ttl_days,
            renew_within_days: config.renew_within_days,
            lister_role: config.lister_role.clone(),
        };
        Ok(Self {
            client,
            config,
            template,
        })
    }

    fn iam_url(&self) -> String {
        format!(
            "{}/storage/v1/b/{}/iam",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AclError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    pub async fn get_policy(&self) -> Result<Policy, AclError> {
        let req = self
            .client
            .get(self.iam_url())
            .query(&[("optionsRequestedPolicyVersion", POLICY_VERSION.to_string())]);
        let response = self.authorize(req).send().await.map_err(transport)?;
        let response = Self::check(response).await?;
        response.json::<Policy>().await.map_err(transport)
    }

    pub async fn set_policy(&self, policy: &Policy) -> Result<Policy, AclError> {
        let req = self.client.put(self.iam_url()).json(policy);
        let response = self.authorize(req).send().await.map_err(transport)?;
        let response = Self::check(response).await?;
        response.json::<Policy>().await.map_err(transport)
    }

    /// One read-modify-write of the policy. Skips the write when `edit` reports no change.
    async fn update_policy<F>(&self, edit: F) -> Result<(), AclError>
    where
        F: FnOnce(&mut Policy, DateTime<Utc>) -> bool + Send,
    {
        let mut policy = self.get_policy().await?;
        policy.version = POLICY_VERSION;

        if !edit(&mut policy, Utc::now()) {
            debug!(bucket = %self.config.bucket, "IAM policy already up to date");
            return Ok(());
        }

        self.set_policy(&policy).await?;
        debug!(
            bucket = %self.config.bucket,
            bindings = policy.bindings.len(),
            "IAM policy updated"
        );
        Ok(())
    }

    async fn apply_changes(&self, changes: &[AclChange]) -> Result<(), AclError> {
        self.update_policy(|policy, now| {
            let mut modified = false;
            for change in changes {
                modified |= self.template.apply(policy, change, now);
            }
            modified
        })
        .await
    }
}

#[async_trait]
impl BucketAcl for GcsBucketAcl {
    async fn add_reader(&self, principal: &Principal, prefix: &AclPrefix) -> Result<(), AclError> {
        self.apply_changes(&[AclChange::add(principal.clone(), prefix.clone())])
            .await
    }

    async fn remove_reader(
        &self,
        principal: &Principal,
        prefix: &AclPrefix,
    ) -> Result<(), AclError> {
        self.apply_changes(&[AclChange::remove(principal.clone(), prefix.clone())])
            .await
    }

    async fn apply_batch(&self, changes: &[AclChange]) -> Vec<Result<(), AclError>> {
        // The policy write is all-or-nothing, so every change shares the outcome.
        let result = self.apply_changes(changes).await;
        vec![result; changes.len()]
    }

    async fn list_grants(&self, principal: &Principal) -> Result<GrantListing, AclError> {
        let policy = self.get_policy().await?;
        Ok(GrantListing {
            reads: self.template.read_grants(&policy, principal, Utc::now()),
            lister: self.template.is_lister(&policy, principal),
        })
    }

    async fn set_lister(&self, principal: &Principal, enabled: bool) -> Result<(), AclError> {
        self.update_policy(|policy, _| self.template.set_lister(policy, principal, enabled))
            .await
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch
    }
}
