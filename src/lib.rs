//! # Restarigi (Password Reset Anti-Abuse Service)
//!
//! `restarigi` is the abuse-protection authority for password resets. It
//! owns rate limiting, CSRF protection, the single-use reset-token
//! lifecycle, and the append-only security audit log; user credentials and
//! email delivery belong to external collaborators.
//!
//! ## Anti-Enumeration
//!
//! `POST /v1/reset/request` answers the same `202` body for existing users,
//! unknown addresses, and rate-limited callers. `POST /v1/reset/confirm`
//! collapses CSRF, unknown-token, expiry, and replay failures into one
//! generic `400`. Fine-grained reasons are recorded only in the audit log.
//!
//! ## Token Lifecycle
//!
//! Reset and CSRF tokens are 32 URL-safe characters of CSPRNG output,
//! stored as SHA-256 hashes, and consumed through single conditional
//! updates — concurrent confirms of the same link admit exactly one winner.
//! A user has at most one live reset token; issuing a new one invalidates
//! prior unconsumed tokens.
//!
//! ## Rate Limiting
//!
//! Requests are counted per client IP (default 5/hour) and per normalized
//! email (default 3/hour) in fixed windows; both dimensions must pass. A
//! counter-store failure denies the request (fail closed), while an audit
//! write failure never blocks the operation it describes (fail open).

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
