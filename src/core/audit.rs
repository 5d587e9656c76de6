//! Audit records for administrative changes.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One administrative action, stamped with service identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub environment: String,
    pub version: String,
    pub tenant: Option<String>,
    pub subject: Option<String>,
    pub action: String,
    pub category: String,
    pub route_template: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub details: BTreeMap<String, String>,
}

/// Service identity stamped on every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub service: String,
    pub environment: String,
    pub version: String,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME").to_string(),
            environment: "development".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AuditContext {
    /// Start an event for `category`/`action`, successful unless changed.
    pub fn event(&self, category: &str, action: &str) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            service: self.service.clone(),
            environment: self.environment.clone(),
            version: self.version.clone(),
            tenant: None,
            subject: None,
            action: action.to_string(),
            category: category.to_string(),
            route_template: None,
            correlation_id: None,
            trace_id: None,
            span_id: None,
            outcome: AuditOutcome::Success,
            reason: None,
            details: BTreeMap::new(),
        }
    }
}

impl AuditEvent {
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn tenant(mut self, tenant: Option<&str>) -> Self {
        self.tenant = tenant.map(str::to_string);
        self
    }

    pub fn route_template(mut self, template: &str) -> Self {
        self.route_template = Some(template.to_string());
        self
    }

    pub fn correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    /// Mark the event failed with `reason`.
    pub fn failed(mut self, reason: impl ToString) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.reason = Some(reason.to_string());
        self
    }
}
