//! Periodic reconciliation: expire, retry pending rows and optionally diff every user.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cidc_audit::{AuditAction, AuditEvent, AuditResult};
use cidc_storage::{AclState, Ledger, PermissionId, StoreError, TrialScope, User, UserId};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::audit::Auditor;
use crate::clock::Clock;
use crate::engine::{Convergence, GrantEngine};
use crate::locks::UserLocks;
use crate::AccessError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Retry pending rows only.
    Incremental,
    /// Also diff every user's store grants against the ledger.
    Full,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::Incremental => "incremental",
            ReconcileMode::Full => "full",
        }
    }
}

impl std::fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub expired: usize,
    pub pending_seen: usize,
    pub settled: usize,
    /// Rows, plus users in a full pass, left for the next pass.
    pub still_pending: usize,
    pub users_converged: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

#[derive(Default)]
struct UserTally {
    settled: usize,
    pending: usize,
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    engine: Arc<GrantEngine>,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
    auditor: Auditor,
    batch_limit: usize,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: Arc<GrantEngine>,
        clock: Arc<dyn Clock>,
        locks: UserLocks,
        auditor: Auditor,
        batch_limit: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            ledger,
            engine,
            clock,
            locks,
            auditor,
            batch_limit,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one pass. A store `PermissionDenied` halts the pass and is returned as
    /// [`AccessError::StoreFatal`] after an `acl.fatal` audit event.
    pub async fn run_pass(&self, mode: ReconcileMode) -> Result<ReconcileReport, AccessError> {
        let start = Instant::now();
        match self.pass(mode).await {
            Ok(mut report) => {
                report.duration = start.elapsed();
                crate::metrics::record_reconcile_pass("ok", report.duration);
                info!(
                    mode = %mode,
                    expired = report.expired,
                    settled = report.settled,
                    still_pending = report.still_pending,
                    users_converged = report.users_converged,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "reconciliation pass complete"
                );
                self.auditor
                    .record(
                        AuditEvent::builder(AuditAction::ReconcilePass)
                            .at(self.clock.now())
                            .resource("reconcile", mode.as_str())
                            .result(if report.still_pending == 0 {
                                AuditResult::Success
                            } else {
                                AuditResult::Pending
                            })
                            .details(serde_json::to_value(&report).unwrap_or_default())
                            .build(),
                    )
                    .await;
                Ok(report)
            }
            Err(err) if err.is_fatal() => {
                crate::metrics::record_reconcile_pass("fatal", start.elapsed());
                error!(mode = %mode, error = %err, "reconciliation halted: object store denied access");
                self.auditor
                    .record(
                        AuditEvent::builder(AuditAction::AclFatal)
                            .at(self.clock.now())
                            .resource("reconcile", mode.as_str())
                            .result(AuditResult::PermissionDenied)
                            .reason(err.to_string())
                            .build(),
                    )
                    .await;
                Err(err)
            }
            Err(err) => {
                crate::metrics::record_reconcile_pass("error", start.elapsed());
                error!(mode = %mode, error = %err, "reconciliation pass failed");
                self.auditor
                    .record(
                        AuditEvent::builder(AuditAction::ReconcilePass)
                            .at(self.clock.now())
                            .resource("reconcile", mode.as_str())
                            .result(AuditResult::Error)
                            .reason(err.to_string())
                            .build(),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn pass(&self, mode: ReconcileMode) -> Result<ReconcileReport, AccessError> {
        let mut report = ReconcileReport::default();

        let expired = self.ledger.sweep_expired(self.clock.now()).await?;
        report.expired = expired.len();
        if !expired.is_empty() {
            crate::metrics::record_expired(expired.len());
            for row in &expired {
                self.auditor
                    .record(
                        AuditEvent::builder(AuditAction::PermissionExpire)
                            .at(self.clock.now())
                            .subject(&row.user_id)
                            .resource("permission", row.id.to_string())
                            .trial_id(match &row.key.trial {
                                TrialScope::Trial(t) => Some(t),
                                TrialScope::Every => None,
                            })
                            .build(),
                    )
                    .await;
            }
        }

        let pending = self.ledger.list_pending_acl(self.batch_limit).await?;
        report.pending_seen = pending.len();
        let mut by_user: BTreeMap<UserId, Vec<PermissionId>> = BTreeMap::new();
        for row in pending {
            by_user.entry(row.user_id).or_default().push(row.id);
        }

        let mut results = stream::iter(by_user)
            .map(|(user_id, ids)| self.settle_user(user_id, ids))
            .buffer_unordered(self.concurrency);
        while let Some(result) = results.next().await {
            let tally = result?;
            report.settled += tally.settled;
            report.still_pending += tally.pending;
        }
        drop(results);

        if mode == ReconcileMode::Full {
            let users = self.ledger.list_users().await?;
            let mut results = stream::iter(users)
                .map(|user| self.converge(user))
                .buffer_unordered(self.concurrency);
            while let Some(result) = results.next().await {
                if result?.is_pending() {
                    report.still_pending += 1;
                }
                report.users_converged += 1;
            }
        }

        Ok(report)
    }

    async fn settle_user(
        &self,
        user_id: UserId,
        ids: Vec<PermissionId>,
    ) -> Result<UserTally, AccessError> {
        let _guard = self.locks.lock(&user_id).await?;
        let user = self.ledger.get_user(&user_id).await?;
        let mut tally = UserTally::default();

        for id in ids {
            // Another writer may have settled the row since it was listed.
            let row = match self.ledger.get_permission(&id).await {
                Ok(row) => row,
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            let convergence = match row.acl_state {
                AclState::PendingGrant if row.active => self.engine.apply_grant(&user, &row).await?,
                AclState::PendingRevoke => self.engine.apply_revoke(&user, &row).await?,
                _ => Convergence::NoOp,
            };
            debug!(permission = %row.id, user = %user.email, ?convergence, "retried pending row");
            match convergence {
                // Waits for approval, not for the store.
                Convergence::Deferred => {}
                c if c.is_settled() => tally.settled += 1,
                _ => tally.pending += 1,
            }
        }
        Ok(tally)
    }

    async fn converge(&self, user: User) -> Result<Convergence, AccessError> {
        let _guard = self.locks.lock(&user.id).await?;
        let user = self.ledger.get_user(&user.id).await?;
        self.engine.converge_user(&user).await
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
