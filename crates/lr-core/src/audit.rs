use crate::lock::Domain;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Notification emitted after a mutation succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub domain: Domain,
    pub action: String,
    /// Table, chain or priority the action touched
    pub target: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(
        domain: Domain,
        action: impl Into<String>,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            action: action.into(),
            target: target.into(),
            detail: detail.into(),
        }
    }
}

/// Fire-and-forget receiver of mutation events.
///
/// `record` returns nothing; a sink that fails must swallow the failure.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        info!(
            target: "audit",
            domain = %event.domain,
            action = %event.action,
            target_name = %event.target,
            detail = %event.detail,
            "mutation applied"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _event: &AuditEvent) {}
}

pub fn tracing_audit() -> Arc<dyn AuditSink> {
    Arc::new(TracingAudit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_lowercase_domain() {
        let event = AuditEvent::new(Domain::Rules, "add", "32000", "from all lookup vpn");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"domain":"rules","action":"add","target":"32000","detail":"from all lookup vpn"}"#
        );
    }
}
