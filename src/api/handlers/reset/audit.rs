//! Append-only security audit events.
//!
//! Every state transition in the reset flow produces an event. Events are
//! immutable once written and are never updated or deleted by this service.
//! A sink failure must never roll back or block the operation it describes:
//! the logger degrades by emitting the full event to the process log.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PasswordResetRequested,
    PasswordResetCompleted,
    PasswordResetFailed,
    PasswordResetTokenGenerated,
    PasswordResetTokenValidated,
    PasswordResetTokenExpired,
    CsrfValidationFailed,
    RateLimitExceeded,
}

impl AuditEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PasswordResetRequested => "password_reset_requested",
            Self::PasswordResetCompleted => "password_reset_completed",
            Self::PasswordResetFailed => "password_reset_failed",
            Self::PasswordResetTokenGenerated => "password_reset_token_generated",
            Self::PasswordResetTokenValidated => "password_reset_token_validated",
            Self::PasswordResetTokenExpired => "password_reset_token_expired",
            Self::CsrfValidationFailed => "csrf_validation_failed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable security event. Raw tokens and passwords never appear here;
/// callers only attach identifiers and coarse reasons.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub user_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        success: bool,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            user_id: None,
            ip,
            user_agent,
            success,
            reason: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Append-only event storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;
}

/// Records security events through an [`AuditSink`], failing open.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append an event. Never fails: a sink error degrades to the process
    /// log so the primary operation proceeds untouched.
    pub async fn log(&self, event: AuditEvent) {
        if let Err(err) = self.sink.append(&event).await {
            let payload = serde_json::to_string(&event)
                .unwrap_or_else(|_| format!("{}:{}", event.event_type, event.id));
            error!(audit_event = %payload, "audit sink write failed, event kept in process log: {err}");
        }
    }
}

/// Process-local sink; tests use `snapshot` to assert on recorded events.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events, in append order.
    ///
    /// # Panics
    /// Panics if the sink lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_match_the_log_schema() {
        assert_eq!(
            AuditEventType::PasswordResetRequested.as_str(),
            "password_reset_requested"
        );
        assert_eq!(
            AuditEventType::CsrfValidationFailed.as_str(),
            "csrf_validation_failed"
        );
        assert_eq!(
            AuditEventType::RateLimitExceeded.as_str(),
            "rate_limit_exceeded"
        );
    }

    #[test]
    fn builders_attach_optional_fields() {
        let user_id = Uuid::new_v4();
        let event = AuditEvent::new(
            AuditEventType::PasswordResetCompleted,
            true,
            Some("203.0.113.5".to_string()),
            None,
        )
        .with_user_id(user_id)
        .with_reason("test")
        .with_metadata(serde_json::json!({"dimension": "email"}));

        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.reason.as_deref(), Some("test"));
        assert_eq!(event.metadata["dimension"], "email");
        assert!(event.success);
    }

    #[tokio::test]
    async fn logger_records_through_the_sink() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone());

        logger
            .log(AuditEvent::new(
                AuditEventType::PasswordResetRequested,
                true,
                None,
                None,
            ))
            .await;

        let events = sink.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::PasswordResetRequested);
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _event: &AuditEvent) -> Result<()> {
            Err(anyhow::anyhow!("sink unavailable"))
        }
    }

    #[tokio::test]
    async fn sink_failure_never_propagates() {
        let logger = AuditLogger::new(Arc::new(FailingSink));
        // Must return normally; the event lands in the process log instead.
        logger
            .log(AuditEvent::new(
                AuditEventType::PasswordResetFailed,
                false,
                None,
                None,
            ))
            .await;
    }
}
