use crate::api;
use crate::api::handlers::reset::ResetConfig;
use anyhow::Result;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub frontend_base_url: String,
    pub token_expire_minutes: i64,
    pub rate_limit_ip_max: u32,
    pub rate_limit_email_max: u32,
    pub rate_limit_window_seconds: u64,
    pub csrf_expire_minutes: i64,
    pub csrf_protection_enabled: bool,
    pub revoke_sessions_on_reset: bool,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let reset_config = ResetConfig::new(args.frontend_base_url)
        .with_token_expire_minutes(args.token_expire_minutes)
        .with_rate_limit_ip_max(args.rate_limit_ip_max)
        .with_rate_limit_email_max(args.rate_limit_email_max)
        .with_rate_limit_window_seconds(args.rate_limit_window_seconds)
        .with_csrf_expire_minutes(args.csrf_expire_minutes)
        .with_csrf_protection_enabled(args.csrf_protection_enabled)
        .with_revoke_sessions_on_reset(args.revoke_sessions_on_reset);

    let email_config = api::email::EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts)
        .with_backoff_base_seconds(args.email_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_outbox_backoff_max_seconds);

    api::new(args.port, args.dsn, reset_config, email_config).await
}
