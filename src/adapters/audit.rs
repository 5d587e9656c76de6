use async_trait::async_trait;

use crate::{
    core::audit::{AuditEvent, AuditOutcome},
    ports::audit_sink::AuditSink,
};

/// Writes audit events as structured `tracing` events on target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) {
        let details = serde_json::to_string(&event.details).unwrap_or_default();
        match event.outcome {
            AuditOutcome::Success => tracing::info!(
                target: "audit",
                id = %event.id,
                service = %event.service,
                environment = %event.environment,
                version = %event.version,
                category = %event.category,
                action = %event.action,
                subject = event.subject.as_deref(),
                tenant = event.tenant.as_deref(),
                route_template = event.route_template.as_deref(),
                correlation_id = event.correlation_id.as_deref(),
                details = %details,
                "audit"
            ),
            AuditOutcome::Failure => tracing::warn!(
                target: "audit",
                id = %event.id,
                service = %event.service,
                environment = %event.environment,
                version = %event.version,
                category = %event.category,
                action = %event.action,
                subject = event.subject.as_deref(),
                tenant = event.tenant.as_deref(),
                route_template = event.route_template.as_deref(),
                correlation_id = event.correlation_id.as_deref(),
                reason = event.reason.as_deref(),
                details = %details,
                "audit"
            ),
        }
    }
}
