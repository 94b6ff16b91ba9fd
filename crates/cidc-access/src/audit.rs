use std::sync::Arc;

use cidc_audit::{AuditEvent, AuditLog};
use tracing::warn;

/// Best-effort audit sink. A failed write is logged and never fails the operation.
#[derive(Clone, Default)]
pub struct Auditor {
    log: Option<Arc<dyn AuditLog>>,
}

impl Auditor {
    pub fn new(log: Option<Arc<dyn AuditLog>>) -> Self {
        Self { log }
    }

    pub async fn record(&self, event: AuditEvent) {
        let Some(log) = &self.log else {
            return;
        };
        let action = event.action.clone();
        if let Err(e) = log.record(event).await {
            warn!(action = %action, error = %e, "failed to write audit event");
        }
    }
}
