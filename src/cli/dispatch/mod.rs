//! Command-line argument dispatch and server initialization.
//!
//! This module parses validated CLI arguments and maps them to the
//! appropriate action, such as starting the API server with its full reset
//! policy configuration.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::reset;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let reset_opts = reset::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        frontend_base_url: reset_opts.frontend_base_url,
        token_expire_minutes: reset_opts.token_expire_minutes,
        rate_limit_ip_max: reset_opts.rate_limit_ip_max,
        rate_limit_email_max: reset_opts.rate_limit_email_max,
        rate_limit_window_seconds: reset_opts.rate_limit_window_seconds,
        csrf_expire_minutes: reset_opts.csrf_expire_minutes,
        csrf_protection_enabled: reset_opts.csrf_protection_enabled,
        revoke_sessions_on_reset: reset_opts.revoke_sessions_on_reset,
        email_outbox_poll_seconds: reset_opts.outbox.poll_seconds,
        email_outbox_batch_size: reset_opts.outbox.batch_size,
        email_outbox_max_attempts: reset_opts.outbox.max_attempts,
        email_outbox_backoff_base_seconds: reset_opts.outbox.backoff_base_seconds,
        email_outbox_backoff_max_seconds: reset_opts.outbox.backoff_max_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::actions::Action;

    #[test]
    fn server_action_carries_policy_values() {
        temp_env::with_vars(
            [
                ("RESTARIGI_DSN", None::<&str>),
                ("PASSWORD_RESET_RATE_LIMIT_EMAIL_MAX", None),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec![
                    "restarigi",
                    "--dsn",
                    "postgres://user@localhost:5432/restarigi",
                    "--rate-limit-email-max",
                    "7",
                ]);
                let action = handler(&matches).expect("dispatch");
                let Action::Server(args) = action;
                assert_eq!(args.port, 8080);
                assert_eq!(args.dsn, "postgres://user@localhost:5432/restarigi");
                assert_eq!(args.rate_limit_email_max, 7);
                assert_eq!(args.token_expire_minutes, 60);
                assert!(args.csrf_protection_enabled);
            },
        );
    }
}
