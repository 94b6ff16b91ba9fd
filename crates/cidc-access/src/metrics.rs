//! Counters and histograms recorded by the access engine.
//!
//! The binary installs a Prometheus recorder; without one these calls are no-ops.

use std::time::Duration;

use cidc_acl::{AclReport, ChangeOutcome};
use metrics::{counter, histogram};

pub const ACL_CHANGES_TOTAL: &str = "cidc_acl_changes_total";
pub const RECONCILE_PASSES_TOTAL: &str = "cidc_reconcile_passes_total";
pub const RECONCILE_DURATION_SECONDS: &str = "cidc_reconcile_duration_seconds";
pub const PERMISSIONS_EXPIRED_TOTAL: &str = "cidc_permissions_expired_total";

fn outcome_label(outcome: &ChangeOutcome) -> &'static str {
    match outcome {
        ChangeOutcome::Applied => "applied",
        ChangeOutcome::Skipped => "skipped",
        ChangeOutcome::Pending(_) => "pending",
    }
}

pub fn record_acl_report(report: &AclReport) {
    for (change, outcome) in &report.outcomes {
        counter!(ACL_CHANGES_TOTAL, "op" => change.op.as_str(), "outcome" => outcome_label(outcome))
            .increment(1);
    }
}

pub fn record_lister(enabled: bool, outcome: &ChangeOutcome) {
    let op = if enabled { "add_lister" } else { "remove_lister" };
    counter!(ACL_CHANGES_TOTAL, "op" => op, "outcome" => outcome_label(outcome)).increment(1);
}

pub fn record_expired(count: usize) {
    counter!(PERMISSIONS_EXPIRED_TOTAL).increment(count as u64);
}

pub fn record_reconcile_pass(result: &'static str, duration: Duration) {
    counter!(RECONCILE_PASSES_TOTAL, "result" => result).increment(1);
    histogram!(RECONCILE_DURATION_SECONDS).record(duration.as_secs_f64());
}
