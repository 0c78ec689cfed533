//! Reset policy and email outbox arguments.
//!
//! The policy surface keeps the environment variable names the upstream
//! deployments already use (`PASSWORD_RESET_*`, `CSRF_*`); service-level
//! knobs live under `RESTARIGI_*`.

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command, builder::BoolishValueParser};

/// Parsed reset policy and outbox settings.
#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub token_expire_minutes: i64,
    pub rate_limit_ip_max: u32,
    pub rate_limit_email_max: u32,
    pub rate_limit_window_seconds: u64,
    pub csrf_expire_minutes: i64,
    pub csrf_protection_enabled: bool,
    pub revoke_sessions_on_reset: bool,
    pub outbox: OutboxOptions,
}

#[derive(Debug)]
pub struct OutboxOptions {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Options {
    /// Read the reset policy out of parsed matches.
    ///
    /// # Errors
    /// Returns an error if a defaulted argument is unexpectedly absent.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            frontend_base_url: matches
                .get_one::<String>("frontend-base-url")
                .cloned()
                .context("missing required argument: --frontend-base-url")?,
            token_expire_minutes: matches
                .get_one::<i64>("reset-token-expire-minutes")
                .copied()
                .context("missing required argument: --reset-token-expire-minutes")?,
            rate_limit_ip_max: matches
                .get_one::<u32>("rate-limit-ip-max")
                .copied()
                .context("missing required argument: --rate-limit-ip-max")?,
            rate_limit_email_max: matches
                .get_one::<u32>("rate-limit-email-max")
                .copied()
                .context("missing required argument: --rate-limit-email-max")?,
            rate_limit_window_seconds: matches
                .get_one::<u64>("rate-limit-window-seconds")
                .copied()
                .context("missing required argument: --rate-limit-window-seconds")?,
            csrf_expire_minutes: matches
                .get_one::<i64>("csrf-token-expire-minutes")
                .copied()
                .context("missing required argument: --csrf-token-expire-minutes")?,
            csrf_protection_enabled: matches
                .get_one::<bool>("csrf-protection-enabled")
                .copied()
                .context("missing required argument: --csrf-protection-enabled")?,
            revoke_sessions_on_reset: matches
                .get_one::<bool>("revoke-sessions-on-reset")
                .copied()
                .context("missing required argument: --revoke-sessions-on-reset")?,
            outbox: OutboxOptions::parse(matches)?,
        })
    }
}

impl OutboxOptions {
    fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            poll_seconds: matches
                .get_one::<u64>("email-outbox-poll-seconds")
                .copied()
                .context("missing required argument: --email-outbox-poll-seconds")?,
            batch_size: matches
                .get_one::<usize>("email-outbox-batch-size")
                .copied()
                .context("missing required argument: --email-outbox-batch-size")?,
            max_attempts: matches
                .get_one::<u32>("email-outbox-max-attempts")
                .copied()
                .context("missing required argument: --email-outbox-max-attempts")?,
            backoff_base_seconds: matches
                .get_one::<u64>("email-outbox-backoff-base-seconds")
                .copied()
                .context("missing required argument: --email-outbox-backoff-base-seconds")?,
            backoff_max_seconds: matches
                .get_one::<u64>("email-outbox-backoff-max-seconds")
                .copied()
                .context("missing required argument: --email-outbox-backoff-max-seconds")?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_policy_args(command);
    with_outbox_args(command)
}

fn with_policy_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend base URL used for reset links")
                .env("RESTARIGI_FRONTEND_BASE_URL")
                .default_value("https://restarigi.dev"),
        )
        .arg(
            Arg::new("reset-token-expire-minutes")
                .long("reset-token-expire-minutes")
                .help("Reset token TTL in minutes")
                .env("PASSWORD_RESET_TOKEN_EXPIRE_MINUTES")
                .default_value("60")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("rate-limit-ip-max")
                .long("rate-limit-ip-max")
                .help("Max reset requests per client IP per window")
                .env("PASSWORD_RESET_RATE_LIMIT_IP_MAX")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("rate-limit-email-max")
                .long("rate-limit-email-max")
                .help("Max reset requests per email per window")
                .env("PASSWORD_RESET_RATE_LIMIT_EMAIL_MAX")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("rate-limit-window-seconds")
                .long("rate-limit-window-seconds")
                .help("Rate limit window in seconds")
                .env("PASSWORD_RESET_RATE_LIMIT_WINDOW")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("csrf-token-expire-minutes")
                .long("csrf-token-expire-minutes")
                .help("CSRF token TTL in minutes")
                .env("CSRF_TOKEN_EXPIRE_MINUTES")
                .default_value("30")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("csrf-protection-enabled")
                .long("csrf-protection-enabled")
                .help("Require CSRF tokens on confirm requests")
                .env("CSRF_PROTECTION_ENABLED")
                .default_value("true")
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("revoke-sessions-on-reset")
                .long("revoke-sessions-on-reset")
                .help("Invalidate the user's other sessions after a completed reset")
                .env("RESTARIGI_REVOKE_SESSIONS_ON_RESET")
                .default_value("false")
                .value_parser(BoolishValueParser::new()),
        )
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-outbox-poll-seconds")
                .long("email-outbox-poll-seconds")
                .help("Email outbox poll interval in seconds")
                .env("RESTARIGI_EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-batch-size")
                .long("email-outbox-batch-size")
                .help("Email outbox batch size per poll")
                .env("RESTARIGI_EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-outbox-max-attempts")
                .long("email-outbox-max-attempts")
                .help("Max attempts before marking an email as failed")
                .env("RESTARIGI_EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("email-outbox-backoff-base-seconds")
                .long("email-outbox-backoff-base-seconds")
                .help("Base delay for email outbox retry backoff")
                .env("RESTARIGI_EMAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-backoff-max-seconds")
                .long("email-outbox-backoff-max-seconds")
                .help("Max delay for email outbox retry backoff")
                .env("RESTARIGI_EMAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
