//! Event and audit sinks.
//!
//! The core emits abstract events (`invoice.generated`, `payment.recorded`,
//! `subscription.cancelled`, ...) and audit entries; delivery and storage
//! belong to the notification and audit subsystems respectively. The default
//! sinks emit structured tracing records.

use async_trait::async_trait;

/// Sink for domain events consumed by the notification subsystem.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Sink for audit entries emitted on every state-changing operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    );
}

/// Default sink that logs events as structured tracing records.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: &str, payload: serde_json::Value) {
        tracing::info!(event = %event, payload = %payload, "Domain event");
    }
}

#[async_trait]
impl AuditSink for TracingSink {
    async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) {
        tracing::info!(
            actor = %actor,
            action = %action,
            entity_type = %entity_type,
            entity_id = %entity_id,
            before = %before.unwrap_or(serde_json::Value::Null),
            after = %after.unwrap_or(serde_json::Value::Null),
            "Audit entry"
        );
    }
}
