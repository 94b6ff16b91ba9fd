use std::time::Duration;

use cidc_acl::AdapterConfig;

pub const DEFAULT_INACTIVE_USER_DAYS: i64 = 60;
pub const DEFAULT_PENDING_BATCH_LIMIT: usize = 500;
pub const DEFAULT_USER_LEASE: Duration = Duration::from_secs(120);

/// Tunables of the access service.
#[derive(Clone, Debug)]
pub struct AccessConfig {
    pub adapter: AdapterConfig,
    /// Approved users idle for longer than this are disabled.
    pub inactive_user_days: i64,
    /// Pending rows retried per reconciliation pass.
    pub pending_batch_limit: usize,
    /// Upper bound on how long one process holds a user's ledger lease.
    pub user_lease: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            inactive_user_days: DEFAULT_INACTIVE_USER_DAYS,
            pending_batch_limit: DEFAULT_PENDING_BATCH_LIMIT,
            user_lease: DEFAULT_USER_LEASE,
        }
    }
}
