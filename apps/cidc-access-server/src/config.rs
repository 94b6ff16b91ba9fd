//! Server configuration read from environment variables.
//!
//! ```bash
//! # Ledger
//! DATABASE_URL=sqlite:///var/lib/cidc/ledger.db
//!
//! # Object store backend: gcs (default) or memory (dry runs)
//! CIDC_ACL_BACKEND=gcs
//! CIDC_DATA_BUCKET=cidc-data-prod
//! CIDC_GCS_ENDPOINT=https://storage.googleapis.com
//! CIDC_GCS_ACCESS_TOKEN=ya29...
//! CIDC_GCS_READ_ROLE=roles/storage.objectViewer
//! CIDC_GCS_LISTER_ROLE=roles/storage.legacyBucketReader
//! CIDC_GCS_TTL_DAYS=90
//! CIDC_GCS_RENEW_DAYS=7
//!
//! # Adapter tuning
//! CIDC_ACL_BATCH_SIZE=50
//! CIDC_ACL_CONCURRENCY=4
//! CIDC_ACL_MAX_ATTEMPTS=4
//!
//! # Engine
//! CIDC_INACTIVE_USER_DAYS=60
//! CIDC_PENDING_BATCH_LIMIT=500
//! CIDC_ROLE_POLICY=/etc/cidc/roles.json
//! CIDC_RECONCILE_INTERVAL_SECS=300
//! CIDC_USER_LEASE_SECS=120
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cidc_access::AccessConfig;
use cidc_acl_gcs::GcsConfig;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://cidc-access.db";
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub acl: AclBackend,
    pub access: AccessConfig,
    /// JSON role table; the built-in table is used when unset.
    pub role_policy_path: Option<PathBuf>,
    pub reconcile_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum AclBackend {
    Gcs(GcsConfig),
    /// In-process bucket; nothing leaves the host.
    Memory,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid ACL backend: {0}. Expected 'gcs' or 'memory'")]
    InvalidBackend(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let backend = lookup("CIDC_ACL_BACKEND").unwrap_or_else(|| "gcs".to_string());
        let acl = match backend.to_lowercase().as_str() {
            "gcs" => {
                let bucket = lookup("CIDC_DATA_BUCKET")
                    .ok_or_else(|| ConfigError::MissingEnvVar("CIDC_DATA_BUCKET".to_string()))?;
                let mut gcs = GcsConfig::new(bucket);
                if let Some(endpoint) = lookup("CIDC_GCS_ENDPOINT") {
                    gcs.endpoint = endpoint;
                }
                gcs.access_token = lookup("CIDC_GCS_ACCESS_TOKEN");
                if let Some(role) = lookup("CIDC_GCS_READ_ROLE") {
                    gcs.read_role = role;
                }
                if let Some(role) = lookup("CIDC_GCS_LISTER_ROLE") {
                    gcs.lister_role = role;
                }
                gcs.ttl_days = parse_opt(&lookup, "CIDC_GCS_TTL_DAYS")?;
                if let Some(days) = parse_opt(&lookup, "CIDC_GCS_RENEW_DAYS")? {
                    gcs.renew_within_days = days;
                }
                AclBackend::Gcs(gcs)
            }
            "memory" => AclBackend::Memory,
            other => return Err(ConfigError::InvalidBackend(other.to_string())),
        };

        let mut access = AccessConfig::default();
        if let Some(batch_size) = parse_opt::<usize, _>(&lookup, "CIDC_ACL_BATCH_SIZE")? {
            access.adapter.batch_size = batch_size.max(1);
        }
        if let Some(concurrency) = parse_opt::<usize, _>(&lookup, "CIDC_ACL_CONCURRENCY")? {
            access.adapter.concurrency = concurrency.max(1);
        }
        if let Some(attempts) = parse_opt::<usize, _>(&lookup, "CIDC_ACL_MAX_ATTEMPTS")? {
            access.adapter.retry.max_attempts = attempts.max(1);
        }
        if let Some(days) = parse_opt(&lookup, "CIDC_INACTIVE_USER_DAYS")? {
            access.inactive_user_days = days;
        }
        if let Some(limit) = parse_opt(&lookup, "CIDC_PENDING_BATCH_LIMIT")? {
            access.pending_batch_limit = limit;
        }
        if let Some(secs) = parse_opt::<u64, _>(&lookup, "CIDC_USER_LEASE_SECS")? {
            access.user_lease = Duration::from_secs(secs.max(1));
        }

        let interval = parse_opt(&lookup, "CIDC_RECONCILE_INTERVAL_SECS")?
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS);

        Ok(Self {
            database_url,
            acl,
            access,
            role_policy_path: lookup("CIDC_ROLE_POLICY").map(PathBuf::from),
            reconcile_interval: Duration::from_secs(interval.max(1)),
        })
    }
}

fn parse_opt<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
    }
}
