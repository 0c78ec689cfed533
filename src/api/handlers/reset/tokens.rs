//! Single-use password reset tokens.
//!
//! Raw tokens are 32 URL-safe characters of CSPRNG output, returned to the
//! caller exactly once; the store only ever sees the SHA-256 hash. A user has
//! at most one live token: issuing a new one invalidates prior unconsumed
//! tokens. Consumption is a single conditional update at the store layer, so
//! concurrent confirm attempts resolve to exactly one winner.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::utils::{generate_reset_token, hash_token};

/// Result of presenting a raw token for consumption.
///
/// Only `Consumed` is a success; the failure variants exist so the audit log
/// can record why, and are collapsed before anything leaves the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenOutcome {
    Consumed { user_id: Uuid },
    NotFound,
    Expired,
    AlreadyConsumed,
}

/// Storage for hashed reset tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a fresh token hash for `user_id` and invalidate any prior
    /// unconsumed tokens for that user in the same operation.
    async fn put_active(&self, user_id: Uuid, token_hash: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically consume the token if it exists, is unexpired, and has not
    /// been consumed. Exactly one concurrent caller can observe `Consumed`.
    async fn consume(&self, token_hash: &[u8]) -> Result<TokenOutcome>;

    /// Physically delete expired rows. Expiry is checked at consumption time
    /// regardless, so this only bounds table growth.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Issues and consumes single-use reset tokens over a [`TokenStore`].
#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    ttl: Duration,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Generate and persist a token for `user_id`, returning the raw value.
    /// The raw token is never retrievable again.
    pub async fn issue(&self, user_id: Uuid) -> Result<String> {
        let raw = generate_reset_token()?;
        self.store
            .put_active(user_id, &hash_token(&raw), self.ttl)
            .await?;
        Ok(raw)
    }

    /// Look up and consume a presented raw token.
    pub async fn validate_and_consume(&self, raw: &str) -> Result<TokenOutcome> {
        self.store.consume(&hash_token(raw)).await
    }
}

struct TokenRow {
    user_id: Uuid,
    expires_at: Instant,
    consumed: bool,
}

/// Process-local token store used by tests and single-instance deployments.
///
/// The mutex spans the whole lookup-and-flip, which is what makes
/// consumption atomic here. Hash lookups scan with constant-time equality so
/// the comparison itself leaks nothing about stored hashes.
#[derive(Default)]
pub struct InMemoryTokenStore {
    rows: Mutex<HashMap<Vec<u8>, TokenRow>>,
}

impl InMemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn put_active(&self, user_id: Uuid, token_hash: &[u8], ttl: Duration) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("token store lock poisoned"))?;
        // Single-active-token policy: drop prior unconsumed tokens for the user.
        rows.retain(|_, row| row.user_id != user_id || row.consumed);
        rows.insert(
            token_hash.to_vec(),
            TokenRow {
                user_id,
                expires_at: Instant::now() + ttl,
                consumed: false,
            },
        );
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8]) -> Result<TokenOutcome> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("token store lock poisoned"))?;
        let now = Instant::now();

        let Some(row) = rows
            .iter_mut()
            .find(|(stored, _)| stored.as_slice().ct_eq(token_hash).into())
            .map(|(_, row)| row)
        else {
            return Ok(TokenOutcome::NotFound);
        };

        if row.consumed {
            return Ok(TokenOutcome::AlreadyConsumed);
        }
        if now >= row.expires_at {
            return Ok(TokenOutcome::Expired);
        }

        row.consumed = true;
        Ok(TokenOutcome::Consumed {
            user_id: row.user_id,
        })
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("token store lock poisoned"))?;
        let before = rows.len();
        rows.retain(|_, row| now < row.expires_at);
        Ok(u64::try_from(before - rows.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn issuer(ttl: Duration) -> TokenIssuer {
        TokenIssuer::new(Arc::new(InMemoryTokenStore::new()), ttl)
    }

    #[tokio::test]
    async fn issue_then_consume_succeeds_exactly_once() -> Result<()> {
        let issuer = issuer(Duration::from_secs(3600));
        let user_id = Uuid::new_v4();

        let raw = issuer.issue(user_id).await?;
        assert_eq!(raw.len(), 32);

        let outcome = issuer.validate_and_consume(&raw).await?;
        assert_eq!(outcome, TokenOutcome::Consumed { user_id });

        let replay = issuer.validate_and_consume(&raw).await?;
        assert_eq!(replay, TokenOutcome::AlreadyConsumed);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() -> Result<()> {
        let issuer = issuer(Duration::from_secs(3600));
        let outcome = issuer.validate_and_consume("not-a-real-token").await?;
        assert_eq!(outcome, TokenOutcome::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_inert_without_cleanup() -> Result<()> {
        let issuer = issuer(Duration::ZERO);
        let raw = issuer.issue(Uuid::new_v4()).await?;
        // No purge has run; expiry is still enforced at validation time.
        let outcome = issuer.validate_and_consume(&raw).await?;
        assert_eq!(outcome, TokenOutcome::Expired);
        Ok(())
    }

    #[tokio::test]
    async fn issuing_invalidates_the_prior_token() -> Result<()> {
        let issuer = issuer(Duration::from_secs(3600));
        let user_id = Uuid::new_v4();

        let first = issuer.issue(user_id).await?;
        let second = issuer.issue(user_id).await?;

        assert_eq!(
            issuer.validate_and_consume(&first).await?,
            TokenOutcome::NotFound
        );
        assert_eq!(
            issuer.validate_and_consume(&second).await?,
            TokenOutcome::Consumed { user_id }
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_consumes_admit_exactly_one() -> Result<()> {
        let issuer = issuer(Duration::from_secs(3600));
        let user_id = Uuid::new_v4();
        let raw = issuer.issue(user_id).await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let issuer = issuer.clone();
            let raw = raw.clone();
            handles.push(tokio::spawn(
                async move { issuer.validate_and_consume(&raw).await },
            ));
        }

        let mut consumed = 0;
        for handle in handles {
            if let TokenOutcome::Consumed { .. } = handle.await?? {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn purge_deletes_only_expired_rows() -> Result<()> {
        let store = Arc::new(InMemoryTokenStore::new());
        let short = TokenIssuer::new(store.clone(), Duration::ZERO);
        let long = TokenIssuer::new(store.clone(), Duration::from_secs(3600));

        short.issue(Uuid::new_v4()).await?;
        let live = long.issue(Uuid::new_v4()).await?;

        assert_eq!(store.purge_expired().await?, 1);
        assert!(matches!(
            long.validate_and_consume(&live).await?,
            TokenOutcome::Consumed { .. }
        ));
        Ok(())
    }
}
