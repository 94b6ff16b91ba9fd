//! Prometheus metrics for the reconciliation loop.
//!
//! The engine records its counters through the `metrics` facade; this module installs the
//! recorder that renders them at `/metrics`.

use cidc_access::metrics::{
    ACL_CHANGES_TOTAL, PERMISSIONS_EXPIRED_TOTAL, RECONCILE_DURATION_SECONDS,
    RECONCILE_PASSES_TOTAL,
};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const READY: &str = "cidc_access_ready";

/// Install the Prometheus recorder. Call once, before the first pass.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        ACL_CHANGES_TOTAL,
        "Object store ACL changes by operation and final outcome"
    );
    describe_counter!(
        PERMISSIONS_EXPIRED_TOTAL,
        "Permissions retired by the expiry sweep"
    );
    describe_counter!(
        RECONCILE_PASSES_TOTAL,
        "Reconciliation passes by result (ok, error, fatal)"
    );
    describe_histogram!(
        RECONCILE_DURATION_SECONDS,
        "Duration of reconciliation passes in seconds"
    );
    describe_gauge!(
        READY,
        "1 while the object store accepts changes, 0 after a fatal store error"
    );

    Ok(handle)
}

pub fn set_ready(ready: bool) {
    gauge!(READY).set(if ready { 1.0 } else { 0.0 });
}
