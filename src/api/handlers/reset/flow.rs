//! Orchestration of the two public reset operations.
//!
//! The request path counts both rate-limit dimensions, looks up the user,
//! issues a token, and enqueues the email — and collapses every one of those
//! outcomes into the same externally-visible acceptance, so responses carry
//! no signal about account existence or limiter state. The confirm path
//! validates and consumes the CSRF token, then the reset token, applies the
//! password through the external collaborators, and records every transition
//! in the audit log.

use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::email::ResetMailer;

use super::audit::{AuditEvent, AuditEventType, AuditLogger};
use super::csrf::CsrfGuard;
use super::rate_limit::{FixedWindowLimiter, RateLimitDecision, RateLimitDimension};
use super::state::ResetConfig;
use super::tokens::{TokenIssuer, TokenOutcome};
use super::users::{PasswordPolicy, UserStore};
use super::utils::{build_reset_url, normalize_email, valid_email};

/// Storage became unavailable mid-operation. Everything else the flow can
/// report is a policy outcome, not an error.
#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("storage unavailable")]
    Persistence(#[from] anyhow::Error),
}

/// Every request collapses into the same acceptance: whether the user
/// exists, the limiter denied, or a token went out, callers see one answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Completed,
    /// Unknown, expired, consumed, or CSRF-rejected. Callers cannot tell
    /// which; the specific reason lives only in the audit log.
    TokenInvalid,
    /// The submitted password failed policy. Disclosable: it describes the
    /// new password, not the reset flow's state.
    PasswordRejected(String),
}

/// Composes the limiter, token issuer, CSRF guard, audit logger, and the
/// external collaborators into the two public operations.
pub struct ResetFlow {
    config: ResetConfig,
    limiter: FixedWindowLimiter,
    tokens: TokenIssuer,
    csrf: CsrfGuard,
    audit: AuditLogger,
    users: Arc<dyn UserStore>,
    policy: Arc<dyn PasswordPolicy>,
    mailer: Arc<dyn ResetMailer>,
}

impl ResetFlow {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: ResetConfig,
        limiter: FixedWindowLimiter,
        tokens: TokenIssuer,
        csrf: CsrfGuard,
        audit: AuditLogger,
        users: Arc<dyn UserStore>,
        policy: Arc<dyn PasswordPolicy>,
        mailer: Arc<dyn ResetMailer>,
    ) -> Self {
        Self {
            config,
            limiter,
            tokens,
            csrf,
            audit,
            users,
            policy,
            mailer,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ResetConfig {
        &self.config
    }

    /// Issue a CSRF token for a rendered confirm form.
    ///
    /// # Errors
    /// Returns `ResetError::Persistence` if the token cannot be stored.
    pub async fn issue_csrf(&self, session_id: Option<&str>) -> Result<String, ResetError> {
        Ok(self.csrf.issue(session_id).await?)
    }

    /// Start a reset: count, look up, issue, enqueue. Always `Accepted`.
    ///
    /// # Errors
    /// Returns `ResetError::Persistence` if the token or outbox store is
    /// unavailable. Limiter storage failures are absorbed (fail closed).
    pub async fn request_reset(
        &self,
        email: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<RequestOutcome, ResetError> {
        let email = normalize_email(email);

        // Both dimensions are evaluated (and counted) independently.
        let ip_decision = self.limiter.check_ip(ip).await;
        let email_decision = self.limiter.check_email(&email).await;
        if ip_decision == RateLimitDecision::Limited
            || email_decision == RateLimitDecision::Limited
        {
            let mut dimensions = Vec::new();
            if ip_decision == RateLimitDecision::Limited {
                dimensions.push(RateLimitDimension::Ip.as_str());
            }
            if email_decision == RateLimitDecision::Limited {
                dimensions.push(RateLimitDimension::Email.as_str());
            }
            self.audit
                .log(
                    self.event(AuditEventType::RateLimitExceeded, false, ip, user_agent)
                        .with_reason(dimensions.join(","))
                        .with_metadata(serde_json::json!({ "dimensions": dimensions })),
                )
                .await;
            return Ok(RequestOutcome::Accepted);
        }

        if !valid_email(&email) {
            self.audit
                .log(
                    self.event(AuditEventType::PasswordResetRequested, false, ip, user_agent)
                        .with_reason("invalid_email"),
                )
                .await;
            return Ok(RequestOutcome::Accepted);
        }

        let Some(user) = self.users.find_by_email(&email).await? else {
            self.audit
                .log(
                    self.event(AuditEventType::PasswordResetRequested, false, ip, user_agent)
                        .with_reason("unknown_email"),
                )
                .await;
            return Ok(RequestOutcome::Accepted);
        };

        // Issuing also invalidates any prior unconsumed token for the user.
        let raw = self.tokens.issue(user.id).await?;
        self.audit
            .log(
                self.event(
                    AuditEventType::PasswordResetTokenGenerated,
                    true,
                    ip,
                    user_agent,
                )
                .with_user_id(user.id),
            )
            .await;

        // The caller's response never waits on delivery; the outbox worker
        // picks the row up asynchronously.
        let reset_url = build_reset_url(self.config.frontend_base_url(), &raw);
        self.mailer.enqueue_reset(&user.email, &reset_url).await?;

        self.audit
            .log(
                self.event(AuditEventType::PasswordResetRequested, true, ip, user_agent)
                    .with_user_id(user.id),
            )
            .await;

        Ok(RequestOutcome::Accepted)
    }

    /// Finish a reset: CSRF, token, policy, password write, audit.
    ///
    /// # Errors
    /// Returns `ResetError::Persistence` if a store is unavailable.
    pub async fn confirm_reset(
        &self,
        raw_token: &str,
        new_password: &SecretString,
        csrf_token: &str,
        session_id: Option<&str>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<ConfirmOutcome, ResetError> {
        let csrf_outcome = self.csrf.validate_and_consume(csrf_token, session_id).await?;
        if !csrf_outcome.is_valid() {
            self.audit
                .log(
                    self.event(AuditEventType::CsrfValidationFailed, false, ip, user_agent)
                        .with_reason(csrf_outcome.reason()),
                )
                .await;
            return Ok(ConfirmOutcome::TokenInvalid);
        }

        match self.tokens.validate_and_consume(raw_token.trim()).await? {
            TokenOutcome::Consumed { user_id } => {
                self.complete(user_id, new_password, ip, user_agent).await
            }
            TokenOutcome::Expired => {
                self.audit
                    .log(self.event(
                        AuditEventType::PasswordResetTokenExpired,
                        false,
                        ip,
                        user_agent,
                    ))
                    .await;
                Ok(ConfirmOutcome::TokenInvalid)
            }
            TokenOutcome::NotFound => {
                self.audit
                    .log(
                        self.event(AuditEventType::PasswordResetFailed, false, ip, user_agent)
                            .with_reason("unknown_token"),
                    )
                    .await;
                Ok(ConfirmOutcome::TokenInvalid)
            }
            TokenOutcome::AlreadyConsumed => {
                self.audit
                    .log(
                        self.event(AuditEventType::PasswordResetFailed, false, ip, user_agent)
                            .with_reason("token_consumed"),
                    )
                    .await;
                Ok(ConfirmOutcome::TokenInvalid)
            }
        }
    }

    async fn complete(
        &self,
        user_id: Uuid,
        new_password: &SecretString,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<ConfirmOutcome, ResetError> {
        self.audit
            .log(
                self.event(
                    AuditEventType::PasswordResetTokenValidated,
                    true,
                    ip,
                    user_agent,
                )
                .with_user_id(user_id),
            )
            .await;

        if let Err(reason) = self.policy.validate(new_password) {
            self.audit
                .log(
                    self.event(AuditEventType::PasswordResetFailed, false, ip, user_agent)
                        .with_user_id(user_id)
                        .with_reason("password_policy"),
                )
                .await;
            return Ok(ConfirmOutcome::PasswordRejected(reason));
        }

        self.users.set_password(user_id, new_password).await?;

        if self.config.revoke_sessions_on_reset() {
            // Hardening step; a revocation failure must not undo the reset.
            match self.users.revoke_sessions(user_id).await {
                Ok(revoked) => debug!(%user_id, revoked, "revoked sessions after password reset"),
                Err(err) => warn!(%user_id, "session revocation failed after password reset: {err}"),
            }
        }

        self.audit
            .log(
                self.event(AuditEventType::PasswordResetCompleted, true, ip, user_agent)
                    .with_user_id(user_id),
            )
            .await;

        Ok(ConfirmOutcome::Completed)
    }

    fn event(
        &self,
        event_type: AuditEventType,
        success: bool,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> AuditEvent {
        AuditEvent::new(
            event_type,
            success,
            ip.map(str::to_string),
            user_agent.map(str::to_string),
        )
    }
}
