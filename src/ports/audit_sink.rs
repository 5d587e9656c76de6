use async_trait::async_trait;

use crate::core::audit::AuditEvent;

/// Destination for administrative audit events.
///
/// Emitting is fire-and-forget: a sink must not fail the operation it records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}
