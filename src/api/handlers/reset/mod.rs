//! Password-reset handlers and supporting modules.
//!
//! This module carries the service's entire abuse-protection surface:
//!
//! - **Rate limiting:** every request is counted per client IP (5 per hour)
//!   and per normalized email (3 per hour); both dimensions must pass.
//! - **Reset tokens:** 32-character single-use tokens, stored as SHA-256
//!   hashes, at most one live token per user, consumed by a conditional
//!   update so concurrent confirms admit exactly one winner.
//! - **CSRF tokens:** same single-use lifecycle, optionally session-bound.
//! - **Audit:** every transition lands in an append-only event log; audit
//!   failures degrade to the process log and never block a reset.
//!
//! Responses are deliberately uniform: `/v1/reset/request` answers 202 with
//! one body no matter what happened, and every confirm failure collapses to
//! one generic message. The audit log is where the detail lives.

pub(crate) mod audit;
pub(crate) mod confirm;
pub(crate) mod csrf;
pub(crate) mod flow;
pub(crate) mod rate_limit;
pub(crate) mod request;
mod state;
mod storage;
mod tokens;
mod types;
pub(crate) mod users;
mod utils;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, AuditSink, InMemoryAuditSink};
pub use csrf::{CsrfGuard, CsrfStore, InMemoryCsrfStore};
pub use flow::{ConfirmOutcome, RequestOutcome, ResetError, ResetFlow};
pub use rate_limit::{
    FixedWindowLimiter, InMemoryRateLimitStore, RateLimitDecision, RateLimitStore,
};
pub use state::{ResetConfig, ResetState, SharedResetState};
pub use storage::{
    PgAuditSink, PgCsrfStore, PgRateLimitStore, PgTokenStore, PgUserStore, spawn_purge_worker,
};
pub use tokens::{InMemoryTokenStore, TokenIssuer, TokenStore};
pub use users::{InMemoryUserStore, MinLengthPolicy, PasswordPolicy, UserStore};
