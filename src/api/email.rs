//! Reset email enqueueing and delivery.
//!
//! `request_reset` never talks to a mail server: it inserts a row into
//! `email_outbox` through [`ResetMailer`] and returns. A background task
//! drains that table on a fixed cadence, locking batches with
//! `FOR UPDATE SKIP LOCKED` so multiple instances never double-send, and
//! hands each row to an [`EmailSender`]. Failed sends are retried with
//! exponential backoff and jitter until `max_attempts`, then parked as
//! `failed`.
//!
//! The default sender for local dev is [`LogEmailSender`], which logs the
//! payload and reports success.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

const RESET_TEMPLATE: &str = "password_reset";

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

/// Enqueue seam used by the reset flow. The raw token only ever appears
/// inside the reset URL; it is the mailer's job to keep it out of logs.
#[async_trait]
pub trait ResetMailer: Send + Sync {
    async fn enqueue_reset(&self, to_email: &str, reset_url: &str) -> Result<()>;
}

/// Production mailer: one outbox row per reset, drained by the worker.
#[derive(Clone)]
pub struct OutboxMailer {
    pool: PgPool,
}

impl OutboxMailer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResetMailer for OutboxMailer {
    async fn enqueue_reset(&self, to_email: &str, reset_url: &str) -> Result<()> {
        let payload = serde_json::json!({
            "email": to_email,
            "reset_url": reset_url,
        });
        let payload_text =
            serde_json::to_string(&payload).context("failed to serialize email payload")?;

        let query = r"
            INSERT INTO email_outbox (to_email, template, payload_json)
            VALUES ($1, $2, $3::jsonb)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(to_email)
            .bind(RESET_TEMPLATE)
            .bind(payload_text)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert email outbox row")?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Defaults: 5s poll, 10 rows per batch, 5 attempts, 5s->5m backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero/inverted settings to workable values.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_secs(1);
        }
        self.batch_size = self.batch_size.max(1);
        self.max_attempts = self.max_attempts.max(1);
        if self.backoff_base.is_zero() {
            self.backoff_base = Duration::from_secs(1);
        }
        if self.backoff_max < self.backoff_base {
            self.backoff_max = self.backoff_base;
        }
        self
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background task that drains the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        loop {
            if let Err(err) = drain_outbox_batch(&pool, sender.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }
            sleep(config.poll_interval).await;
        }
    })
}

async fn drain_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Locked batch so concurrent workers never pick the same rows.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size).unwrap_or(1))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let attempt = u32::try_from(attempts).unwrap_or(0).saturating_add(1);
        let settlement = match sender.send(&message) {
            Ok(()) => Settlement::Sent,
            Err(err) if attempt >= config.max_attempts => Settlement::Failed(err.to_string()),
            Err(err) => Settlement::Retry {
                error: err.to_string(),
                delay: backoff_delay(attempt, config.backoff_base, config.backoff_max),
            },
        };
        settle_outbox_row(&mut tx, id, attempt, &settlement).await?;
    }

    // Commit even when the batch was empty to release the locks promptly.
    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

enum Settlement {
    Sent,
    Retry { error: String, delay: Duration },
    Failed(String),
}

async fn settle_outbox_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempt: u32,
    settlement: &Settlement,
) -> Result<()> {
    let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);
    let (query, last_error, delay_ms) = match settlement {
        Settlement::Sent => (
            r"
            UPDATE email_outbox
            SET status = 'sent',
                attempts = $2,
                last_error = NULL,
                sent_at = NOW(),
                next_attempt_at = NOW()
            WHERE id = $1
            ",
            None,
            0_i64,
        ),
        Settlement::Retry { error, delay } => (
            r"
            UPDATE email_outbox
            SET status = 'pending',
                attempts = $2,
                last_error = $3,
                next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
            WHERE id = $1
            ",
            Some(error.as_str()),
            i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
        ),
        Settlement::Failed(error) => (
            r"
            UPDATE email_outbox
            SET status = 'failed',
                attempts = $2,
                last_error = $3,
                next_attempt_at = NOW()
            WHERE id = $1
            ",
            Some(error.as_str()),
            0_i64,
        ),
    };

    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let mut statement = sqlx::query(query).bind(id).bind(attempt);
    if let Some(last_error) = last_error {
        statement = statement.bind(last_error);
    }
    if matches!(settlement, Settlement::Retry { .. }) {
        statement = statement.bind(delay_ms);
    }
    statement
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to settle email outbox row")?;
    Ok(())
}

/// Exponential backoff capped at `max`, with jitter in `[delay/2, delay]`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max).min(max);

    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        let first = backoff_delay(1, base, max);
        assert!(first >= Duration::from_millis(2500) && first <= base);

        let deep = backoff_delay(30, base, max);
        assert!(deep >= Duration::from_secs(150) && deep <= max);
    }

    #[test]
    fn normalize_clamps_degenerate_settings() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();

        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert!(config.backoff_max >= config.backoff_base);
    }

    #[test]
    fn log_sender_always_succeeds() {
        let sender = LogEmailSender;
        let message = EmailMessage {
            to_email: "user@example.com".to_string(),
            template: RESET_TEMPLATE.to_string(),
            payload_json: "{}".to_string(),
        };
        assert!(sender.send(&message).is_ok());
    }
}
