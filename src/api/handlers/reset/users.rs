//! Seams to the external collaborators: user credential storage and the
//! new-password policy. The upstream IAM owns both; restarigi only needs
//! lookup, password write, and (optionally) session revocation.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
}

/// External user credential store.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<UserRecord>>;

    async fn set_password(&self, user_id: Uuid, new_password: &SecretString) -> Result<()>;

    /// Invalidate the user's other active sessions (hardening step, behind a
    /// deployment flag). Returns the number of sessions revoked.
    async fn revoke_sessions(&self, user_id: Uuid) -> Result<u64>;
}

/// External new-password validation. Failures are disclosable: they describe
/// the submitted password, not the reset flow's internal state.
pub trait PasswordPolicy: Send + Sync {
    /// `Err` carries the reason shown to the caller.
    fn validate(&self, password: &SecretString) -> Result<(), String>;
}

/// Baseline policy used when the deployment does not inject its own:
/// a minimum length over non-whitespace input.
#[derive(Clone, Copy, Debug)]
pub struct MinLengthPolicy {
    min_chars: usize,
}

impl MinLengthPolicy {
    #[must_use]
    pub const fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl Default for MinLengthPolicy {
    fn default() -> Self {
        Self::new(12)
    }
}

impl PasswordPolicy for MinLengthPolicy {
    fn validate(&self, password: &SecretString) -> Result<(), String> {
        let password = password.expose_secret();
        if password.trim().is_empty() {
            return Err("Password must not be empty".to_string());
        }
        if password.chars().count() < self.min_chars {
            return Err(format!(
                "Password must be at least {} characters",
                self.min_chars
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryUsersInner {
    users: HashMap<String, UserRecord>,
    password_writes: Vec<Uuid>,
    sessions: HashMap<Uuid, u64>,
}

/// Test double for the external store; records password writes so tests can
/// assert `set_password` was called exactly once.
#[derive(Default)]
pub struct InMemoryUserStore {
    inner: Mutex<InMemoryUsersInner>,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and return its id. `email` is stored as given; pass
    /// normalized input when the test exercises lookups.
    ///
    /// # Panics
    /// Panics if the store lock is poisoned.
    pub fn insert_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        inner.users.insert(
            email.to_string(),
            UserRecord {
                id,
                email: email.to_string(),
            },
        );
        id
    }

    /// # Panics
    /// Panics if the store lock is poisoned.
    pub fn set_active_sessions(&self, user_id: Uuid, count: u64) {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        inner.sessions.insert(user_id, count);
    }

    /// User ids `set_password` was called with, in call order.
    ///
    /// # Panics
    /// Panics if the store lock is poisoned.
    #[must_use]
    pub fn password_writes(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .expect("user store lock poisoned")
            .password_writes
            .clone()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<UserRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("user store lock poisoned"))?;
        Ok(inner.users.get(email_normalized).cloned())
    }

    async fn set_password(&self, user_id: Uuid, _new_password: &SecretString) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("user store lock poisoned"))?;
        inner.password_writes.push(user_id);
        Ok(())
    }

    async fn revoke_sessions(&self, user_id: Uuid) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("user store lock poisoned"))?;
        Ok(inner.sessions.remove(&user_id).unwrap_or(0))
    }
}
