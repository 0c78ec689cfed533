//! Single-use anti-forgery tokens for the confirm form.
//!
//! Same lifecycle as reset tokens (hashed at rest, consumed by a conditional
//! update), with an optional session binding. All failure modes collapse to
//! one generic invalid result externally; the distinction only reaches the
//! audit log.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

use super::utils::{generate_csrf_token, hash_token};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrfOutcome {
    Valid,
    Unknown,
    Expired,
    SessionMismatch,
}

impl CsrfOutcome {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Audit-only failure reason; never surfaced to callers.
    pub(super) const fn reason(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Unknown => "unknown_token",
            Self::Expired => "token_expired",
            Self::SessionMismatch => "session_mismatch",
        }
    }
}

/// Storage for hashed CSRF tokens.
#[async_trait]
pub trait CsrfStore: Send + Sync {
    async fn put(&self, token_hash: &[u8], session_id: Option<&str>, ttl: Duration) -> Result<()>;

    /// Atomically consume the token if it matches: present, unexpired,
    /// unconsumed, and bound to the presented session (when bound at all).
    /// A failed match leaves the row untouched.
    async fn consume(&self, token_hash: &[u8], session_id: Option<&str>) -> Result<CsrfOutcome>;

    async fn purge_expired(&self) -> Result<u64>;
}

/// Issues and validates anti-forgery tokens over a [`CsrfStore`].
///
/// The deployment toggle (`CSRF_PROTECTION_ENABLED`) turns validation into a
/// pass-through without touching call sites.
#[derive(Clone)]
pub struct CsrfGuard {
    store: Arc<dyn CsrfStore>,
    ttl: Duration,
    enabled: bool,
}

impl CsrfGuard {
    #[must_use]
    pub fn new(store: Arc<dyn CsrfStore>, ttl: Duration, enabled: bool) -> Self {
        Self {
            store,
            ttl,
            enabled,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for a rendered form, optionally bound to a session.
    pub async fn issue(&self, session_id: Option<&str>) -> Result<String> {
        let raw = generate_csrf_token()?;
        self.store
            .put(&hash_token(&raw), session_id, self.ttl)
            .await?;
        Ok(raw)
    }

    /// Validate and consume a presented token.
    pub async fn validate_and_consume(
        &self,
        token: &str,
        session_id: Option<&str>,
    ) -> Result<CsrfOutcome> {
        if !self.enabled {
            return Ok(CsrfOutcome::Valid);
        }
        let token = token.trim();
        if token.is_empty() {
            return Ok(CsrfOutcome::Unknown);
        }
        self.store.consume(&hash_token(token), session_id).await
    }
}

struct CsrfRow {
    session_id: Option<String>,
    expires_at: Instant,
    consumed: bool,
}

impl CsrfRow {
    fn session_matches(&self, presented: Option<&str>) -> bool {
        match &self.session_id {
            // Unbound tokens accept any presenter.
            None => true,
            Some(bound) => presented == Some(bound.as_str()),
        }
    }
}

/// Process-local CSRF store used by tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryCsrfStore {
    rows: Mutex<HashMap<Vec<u8>, CsrfRow>>,
}

impl InMemoryCsrfStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CsrfStore for InMemoryCsrfStore {
    async fn put(&self, token_hash: &[u8], session_id: Option<&str>, ttl: Duration) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("csrf store lock poisoned"))?;
        rows.insert(
            token_hash.to_vec(),
            CsrfRow {
                session_id: session_id.map(str::to_string),
                expires_at: Instant::now() + ttl,
                consumed: false,
            },
        );
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8], session_id: Option<&str>) -> Result<CsrfOutcome> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("csrf store lock poisoned"))?;
        let now = Instant::now();

        let Some(row) = rows
            .iter_mut()
            .find(|(stored, _)| stored.as_slice().ct_eq(token_hash).into())
            .map(|(_, row)| row)
        else {
            return Ok(CsrfOutcome::Unknown);
        };

        if row.consumed {
            return Ok(CsrfOutcome::Unknown);
        }
        if now >= row.expires_at {
            return Ok(CsrfOutcome::Expired);
        }
        if !row.session_matches(session_id) {
            // Leave the row live: a mismatched presenter must not be able to
            // burn a token bound to someone else's session.
            return Ok(CsrfOutcome::SessionMismatch);
        }

        row.consumed = true;
        Ok(CsrfOutcome::Valid)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("csrf store lock poisoned"))?;
        let before = rows.len();
        rows.retain(|_, row| now < row.expires_at);
        Ok(u64::try_from(before - rows.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn guard(ttl: Duration, enabled: bool) -> CsrfGuard {
        CsrfGuard::new(Arc::new(InMemoryCsrfStore::new()), ttl, enabled)
    }

    #[tokio::test]
    async fn issue_then_validate_consumes_once() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), true);
        let token = guard.issue(None).await?;

        assert_eq!(
            guard.validate_and_consume(&token, None).await?,
            CsrfOutcome::Valid
        );
        assert_eq!(
            guard.validate_and_consume(&token, None).await?,
            CsrfOutcome::Unknown
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_fails_validation() -> Result<()> {
        let guard = guard(Duration::ZERO, true);
        let token = guard.issue(None).await?;
        assert_eq!(
            guard.validate_and_consume(&token, None).await?,
            CsrfOutcome::Expired
        );
        Ok(())
    }

    #[tokio::test]
    async fn session_binding_is_enforced() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), true);
        let token = guard.issue(Some("session-a")).await?;

        assert_eq!(
            guard.validate_and_consume(&token, Some("session-b")).await?,
            CsrfOutcome::SessionMismatch
        );
        assert_eq!(
            guard.validate_and_consume(&token, None).await?,
            CsrfOutcome::SessionMismatch
        );
        // A mismatch must not consume the token.
        assert_eq!(
            guard.validate_and_consume(&token, Some("session-a")).await?,
            CsrfOutcome::Valid
        );
        Ok(())
    }

    #[tokio::test]
    async fn unbound_token_accepts_any_session() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), true);
        let token = guard.issue(None).await?;
        assert_eq!(
            guard.validate_and_consume(&token, Some("anything")).await?,
            CsrfOutcome::Valid
        );
        Ok(())
    }

    #[tokio::test]
    async fn disabled_guard_passes_everything() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), false);
        assert_eq!(
            guard.validate_and_consume("whatever", None).await?,
            CsrfOutcome::Valid
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_token_is_unknown() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), true);
        assert_eq!(
            guard.validate_and_consume("  ", None).await?,
            CsrfOutcome::Unknown
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_validations_admit_exactly_one() -> Result<()> {
        let guard = guard(Duration::from_secs(1800), true);
        let token = guard.issue(None).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                guard.validate_and_consume(&token, None).await
            }));
        }

        let mut valid = 0;
        for handle in handles {
            if handle.await??.is_valid() {
                valid += 1;
            }
        }
        assert_eq!(valid, 1);
        Ok(())
    }
}
