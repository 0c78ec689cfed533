//! Fixed-window rate limiting for the reset flow.
//!
//! Requests are counted per `dimension:identity` key (`ip:203.0.113.5`,
//! `email:user@example.com`). Both dimensions must pass independently.
//! Increment-and-compare is atomic per key at the store layer, so two
//! concurrent requests never both pass on a stale count.
//!
//! A store failure fails closed: the limiter reports `Limited` rather than
//! letting an outage disable abuse protection.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::error;

/// Opportunistic eviction kicks in once the in-memory map grows past this.
const EVICTION_THRESHOLD: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDimension {
    Ip,
    Email,
}

impl RateLimitDimension {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Email => "email",
        }
    }

    /// Counter key: `dimension:identity`. Identities arrive pre-normalized.
    pub(crate) fn key(self, identity: &str) -> String {
        format!("{}:{}", self.as_str(), identity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Storage for fixed-window counters.
///
/// `check_and_increment` must be atomic per key: increment the counter for
/// the current window and report whether the post-increment count is within
/// `max`. Denial is a policy outcome, not an error.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check_and_increment(&self, key: &str, max: u32, window: Duration) -> Result<bool>;

    /// Drop counters whose window has elapsed. Correctness never depends on
    /// this having run; it only bounds memory/table growth.
    async fn purge_expired(&self, window: Duration) -> Result<u64>;
}

/// Dual-keyed fixed-window limiter over a [`RateLimitStore`].
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    ip_max: u32,
    email_max: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, ip_max: u32, email_max: u32, window: Duration) -> Self {
        Self {
            store,
            ip_max,
            email_max,
            window,
        }
    }

    /// Check and count a request for the IP dimension.
    /// Requests without a resolvable client IP skip this dimension.
    pub async fn check_ip(&self, ip: Option<&str>) -> RateLimitDecision {
        match ip {
            Some(ip) => {
                self.check(RateLimitDimension::Ip, ip, self.ip_max).await
            }
            None => RateLimitDecision::Allowed,
        }
    }

    /// Check and count a request for the email dimension (normalized input).
    pub async fn check_email(&self, email_normalized: &str) -> RateLimitDecision {
        self.check(RateLimitDimension::Email, email_normalized, self.email_max)
            .await
    }

    async fn check(
        &self,
        dimension: RateLimitDimension,
        identity: &str,
        max: u32,
    ) -> RateLimitDecision {
        let key = dimension.key(identity);
        match self.store.check_and_increment(&key, max, self.window).await {
            Ok(true) => RateLimitDecision::Allowed,
            Ok(false) => RateLimitDecision::Limited,
            Err(err) => {
                error!("rate limit store failed for {key}: {err}");
                RateLimitDecision::Limited // Fail closed
            }
        }
    }
}

struct WindowCounter {
    window_start: Instant,
    count: u32,
}

/// Process-local counter store.
///
/// The mutex is held across the whole read-modify-write, which is what makes
/// the increment atomic. Keys are attacker-controlled, so expired windows
/// are evicted opportunistically once the map grows.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl InMemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_increment(&self, key: &str, max: u32, window: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit counter lock poisoned"))?;

        if counters.len() >= EVICTION_THRESHOLD {
            counters.retain(|_, counter| now.duration_since(counter.window_start) < window);
        }

        let counter = counters.entry(key.to_string()).or_insert(WindowCounter {
            window_start: now,
            count: 0,
        });

        // Crossing the window boundary implicitly resets the counter.
        if now.duration_since(counter.window_start) >= window {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count = counter.count.saturating_add(1);
        Ok(counter.count <= max)
    }

    async fn purge_expired(&self, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit counter lock poisoned"))?;
        let before = counters.len();
        counters.retain(|_, counter| now.duration_since(counter.window_start) < window);
        Ok(u64::try_from(before - counters.len()).unwrap_or(0))
    }
}
