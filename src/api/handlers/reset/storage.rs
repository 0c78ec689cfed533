//! Postgres-backed stores for tokens, CSRF, counters, audit, and users.
//!
//! The consumption races in this subsystem are resolved here, not in the
//! application: `consumed_at` flips through a single conditional UPDATE and
//! the counter increment is a single upsert, so concurrent callers can never
//! both observe stale state. Follow-up reads after a failed consume exist
//! only to classify the failure for the audit log.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use super::audit::{AuditEvent, AuditSink};
use super::csrf::{CsrfOutcome, CsrfStore};
use super::rate_limit::RateLimitStore;
use super::tokens::{TokenOutcome, TokenStore};
use super::users::{UserRecord, UserStore};

/// Fixed-window counters in `rate_limit_counters`.
#[derive(Clone)]
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn check_and_increment(&self, key: &str, max: u32, window: Duration) -> Result<bool> {
        // Upsert and compare in one statement; the row count is authoritative
        // even when two requests race on the same key.
        let query = r"
            INSERT INTO rate_limit_counters (key, window_start, count)
            VALUES ($1, to_timestamp(floor(extract(epoch FROM NOW()) / $2) * $2), 1)
            ON CONFLICT (key, window_start)
            DO UPDATE SET count = rate_limit_counters.count + 1
            RETURNING count
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .bind(window.as_secs_f64())
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment rate limit counter")?;

        let count: i64 = row.get("count");
        Ok(count <= i64::from(max))
    }

    async fn purge_expired(&self, window: Duration) -> Result<u64> {
        let query = r"
            DELETE FROM rate_limit_counters
            WHERE window_start < NOW() - ($1 * INTERVAL '1 second')
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(window.as_secs_f64())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge rate limit counters")?;
        Ok(result.rows_affected())
    }
}

/// Hashed reset tokens in `password_reset_tokens`.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn put_active(&self, user_id: Uuid, token_hash: &[u8], ttl: Duration) -> Result<()> {
        // One transaction so invalidating priors and inserting the fresh
        // token land together.
        let mut tx = self.pool.begin().await.context("begin token transaction")?;

        let query = r"
            DELETE FROM password_reset_tokens
            WHERE user_id = $1 AND consumed_at IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to invalidate prior reset tokens")?;

        let query = r"
            INSERT INTO password_reset_tokens (token_hash, user_id, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .bind(user_id)
            .bind(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert reset token")?;

        tx.commit().await.context("commit token transaction")?;
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8]) -> Result<TokenOutcome> {
        // At-most-once consumption: only the caller whose UPDATE affects the
        // row gets the user id back.
        let query = r"
            UPDATE password_reset_tokens
            SET consumed_at = NOW()
            WHERE token_hash = $1
              AND consumed_at IS NULL
              AND expires_at > NOW()
            RETURNING user_id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume reset token")?;

        if let Some(row) = row {
            return Ok(TokenOutcome::Consumed {
                user_id: row.get("user_id"),
            });
        }

        // Audit-only classification; the row state may have moved under us,
        // but by now the consume itself has definitively failed.
        let query = r"
            SELECT expires_at, consumed_at
            FROM password_reset_tokens
            WHERE token_hash = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to classify reset token")?;

        let Some(row) = row else {
            return Ok(TokenOutcome::NotFound);
        };
        Ok(classify_failed_consume(
            row.get("consumed_at"),
            row.get("expires_at"),
            Utc::now(),
        ))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM password_reset_tokens WHERE expires_at <= NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge reset tokens")?;
        Ok(result.rows_affected())
    }
}

/// Why a conditional consume matched no row.
fn classify_failed_consume(
    consumed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TokenOutcome {
    if consumed_at.is_some() {
        TokenOutcome::AlreadyConsumed
    } else if now >= expires_at {
        TokenOutcome::Expired
    } else {
        // The row looked live on the follow-up read, so a concurrent caller
        // must have won the conditional update in between.
        TokenOutcome::AlreadyConsumed
    }
}

/// Hashed anti-forgery tokens in `csrf_tokens`.
#[derive(Clone)]
pub struct PgCsrfStore {
    pool: PgPool,
}

impl PgCsrfStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CsrfStore for PgCsrfStore {
    async fn put(&self, token_hash: &[u8], session_id: Option<&str>, ttl: Duration) -> Result<()> {
        let query = r"
            INSERT INTO csrf_tokens (token_hash, session_id, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .bind(session_id)
            .bind(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert csrf token")?;
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8], session_id: Option<&str>) -> Result<CsrfOutcome> {
        // A mismatched session must not consume the row, so the binding check
        // is part of the conditional update itself.
        let query = r"
            UPDATE csrf_tokens
            SET consumed_at = NOW()
            WHERE token_hash = $1
              AND consumed_at IS NULL
              AND expires_at > NOW()
              AND (session_id IS NULL OR session_id = $2)
            RETURNING token_hash
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume csrf token")?;

        if row.is_some() {
            return Ok(CsrfOutcome::Valid);
        }

        let query = r"
            SELECT session_id, expires_at, consumed_at
            FROM csrf_tokens
            WHERE token_hash = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to classify csrf token")?;

        let Some(row) = row else {
            return Ok(CsrfOutcome::Unknown);
        };
        Ok(classify_failed_csrf(
            row.get("consumed_at"),
            row.get("expires_at"),
            Utc::now(),
        ))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM csrf_tokens WHERE expires_at <= NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge csrf tokens")?;
        Ok(result.rows_affected())
    }
}

fn classify_failed_csrf(
    consumed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CsrfOutcome {
    if consumed_at.is_some() {
        CsrfOutcome::Unknown
    } else if now >= expires_at {
        CsrfOutcome::Expired
    } else {
        // Live and unconsumed yet the conditional update refused it: the
        // session binding did not match.
        CsrfOutcome::SessionMismatch
    }
}

/// Append-only sink over `security_audit_events`.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let metadata =
            serde_json::to_string(&event.metadata).context("failed to serialize audit metadata")?;

        let query = r"
            INSERT INTO security_audit_events
                (id, event_type, user_id, ip, user_agent, success, reason, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::jsonb, $9)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(event.id)
            .bind(event.event_type.as_str())
            .bind(event.user_id)
            .bind(event.ip.as_deref())
            .bind(event.user_agent.as_deref())
            .bind(event.success)
            .bind(event.reason.as_deref())
            .bind(metadata)
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to append audit event")?;
        Ok(())
    }
}

/// Users live in the shared IAM schema; restarigi touches id, email, and
/// password_hash, plus session rows for the optional revocation step.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<UserRecord>> {
        let query = "SELECT id, email FROM users WHERE email = $1 LIMIT 1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email_normalized)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;

        Ok(row.map(|row| UserRecord {
            id: row.get("id"),
            email: row.get("email"),
        }))
    }

    async fn set_password(&self, user_id: Uuid, new_password: &SecretString) -> Result<()> {
        let query = r"
            UPDATE users
            SET password_hash = crypt($2, gen_salt('bf')),
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(new_password.expose_secret())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to set password")?;

        if result.rows_affected() != 1 {
            return Err(anyhow!("password update matched no user: {user_id}"));
        }
        Ok(())
    }

    async fn revoke_sessions(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM user_sessions WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke user sessions")?;
        Ok(result.rows_affected())
    }
}

/// Spawn the background task that reaps expired tokens, CSRF rows, and
/// rate-limit counters. Validation-time expiry checks never depend on this.
pub fn spawn_purge_worker(
    tokens: Arc<dyn TokenStore>,
    csrf: Arc<dyn CsrfStore>,
    limits: Arc<dyn RateLimitStore>,
    window: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match tokens.purge_expired().await {
                Ok(purged) => debug!(purged, "purged expired reset tokens"),
                Err(err) => error!("reset token purge failed: {err}"),
            }
            match csrf.purge_expired().await {
                Ok(purged) => debug!(purged, "purged expired csrf tokens"),
                Err(err) => error!("csrf token purge failed: {err}"),
            }
            match limits.purge_expired(window).await {
                Ok(purged) => debug!(purged, "purged expired rate limit counters"),
                Err(err) => error!("rate limit counter purge failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn failed_consume_prefers_consumed_over_expired() {
        let now = Utc::now();
        let outcome = classify_failed_consume(Some(now), now - TimeDelta::seconds(10), now);
        assert_eq!(outcome, TokenOutcome::AlreadyConsumed);
    }

    #[test]
    fn failed_consume_reports_expiry() {
        let now = Utc::now();
        let outcome = classify_failed_consume(None, now - TimeDelta::seconds(1), now);
        assert_eq!(outcome, TokenOutcome::Expired);
    }

    #[test]
    fn failed_consume_on_live_row_means_lost_race() {
        let now = Utc::now();
        let outcome = classify_failed_consume(None, now + TimeDelta::seconds(60), now);
        assert_eq!(outcome, TokenOutcome::AlreadyConsumed);
    }

    #[test]
    fn failed_csrf_on_live_row_means_session_mismatch() {
        let now = Utc::now();
        let outcome = classify_failed_csrf(None, now + TimeDelta::seconds(60), now);
        assert_eq!(outcome, CsrfOutcome::SessionMismatch);
    }

    #[test]
    fn failed_csrf_reports_expiry() {
        let now = Utc::now();
        let outcome = classify_failed_csrf(None, now - TimeDelta::seconds(1), now);
        assert_eq!(outcome, CsrfOutcome::Expired);
    }
}
