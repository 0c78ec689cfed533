//! Reset flow configuration and shared handler state.

use std::sync::Arc;
use std::time::Duration;

use super::flow::ResetFlow;

const DEFAULT_TOKEN_EXPIRE_MINUTES: i64 = 60;
const DEFAULT_RATE_LIMIT_IP_MAX: u32 = 5;
const DEFAULT_RATE_LIMIT_EMAIL_MAX: u32 = 3;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 3600;
const DEFAULT_CSRF_EXPIRE_MINUTES: i64 = 30;

/// Typed, immutable reset policy, built once at startup from CLI/env and
/// passed explicitly to constructors. No ambient lookups after that.
#[derive(Clone, Debug)]
pub struct ResetConfig {
    frontend_base_url: String,
    token_expire_minutes: i64,
    rate_limit_ip_max: u32,
    rate_limit_email_max: u32,
    rate_limit_window_seconds: u64,
    csrf_expire_minutes: i64,
    csrf_protection_enabled: bool,
    revoke_sessions_on_reset: bool,
}

impl ResetConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            token_expire_minutes: DEFAULT_TOKEN_EXPIRE_MINUTES,
            rate_limit_ip_max: DEFAULT_RATE_LIMIT_IP_MAX,
            rate_limit_email_max: DEFAULT_RATE_LIMIT_EMAIL_MAX,
            rate_limit_window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            csrf_expire_minutes: DEFAULT_CSRF_EXPIRE_MINUTES,
            csrf_protection_enabled: true,
            revoke_sessions_on_reset: false,
        }
    }

    #[must_use]
    pub fn with_token_expire_minutes(mut self, minutes: i64) -> Self {
        self.token_expire_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_rate_limit_ip_max(mut self, max: u32) -> Self {
        self.rate_limit_ip_max = max;
        self
    }

    #[must_use]
    pub fn with_rate_limit_email_max(mut self, max: u32) -> Self {
        self.rate_limit_email_max = max;
        self
    }

    #[must_use]
    pub fn with_rate_limit_window_seconds(mut self, seconds: u64) -> Self {
        self.rate_limit_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_csrf_expire_minutes(mut self, minutes: i64) -> Self {
        self.csrf_expire_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_csrf_protection_enabled(mut self, enabled: bool) -> Self {
        self.csrf_protection_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_revoke_sessions_on_reset(mut self, enabled: bool) -> Self {
        self.revoke_sessions_on_reset = enabled;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(crate) fn token_expire_minutes(&self) -> i64 {
        self.token_expire_minutes
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.token_expire_minutes.max(0)).unwrap_or(0) * 60)
    }

    #[must_use]
    pub fn rate_limit_ip_max(&self) -> u32 {
        self.rate_limit_ip_max
    }

    #[must_use]
    pub fn rate_limit_email_max(&self) -> u32 {
        self.rate_limit_email_max
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub(crate) fn csrf_expire_minutes(&self) -> i64 {
        self.csrf_expire_minutes
    }

    #[must_use]
    pub fn csrf_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.csrf_expire_minutes.max(0)).unwrap_or(0) * 60)
    }

    #[must_use]
    pub fn csrf_protection_enabled(&self) -> bool {
        self.csrf_protection_enabled
    }

    #[must_use]
    pub fn revoke_sessions_on_reset(&self) -> bool {
        self.revoke_sessions_on_reset
    }
}

/// Shared state handed to the reset handlers via `Extension<Arc<ResetState>>`.
pub struct ResetState {
    config: ResetConfig,
    flow: ResetFlow,
}

impl ResetState {
    #[must_use]
    pub fn new(config: ResetConfig, flow: ResetFlow) -> Self {
        Self { config, flow }
    }

    #[must_use]
    pub fn config(&self) -> &ResetConfig {
        &self.config
    }

    #[must_use]
    pub fn flow(&self) -> &ResetFlow {
        &self.flow
    }
}

/// Convenience alias used by handler signatures.
pub type SharedResetState = Arc<ResetState>;
