//! Global admission gate for requests to the external source
//!
//! A single [`RateLimiter`] is shared by every worker in the process. It
//! enforces a minimum spacing between admissions (GCRA via `governor`) and
//! grants admission in request order: waiters queue on a fair tokio mutex,
//! so a worker that asked first is admitted first and nobody starves.

use governor::{DefaultDirectRateLimiter, Quota};
use harvest_common::HarvestError;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// Rate limiting configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained admissions per second
    pub requests_per_second: u32,

    /// Admissions allowed back to back before spacing applies (1 = strict spacing)
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            ..Self::default()
        }
    }

    /// Minimum spacing between two admissions
    pub fn spacing(&self) -> Duration {
        Duration::from_secs(1) / self.requests_per_second.max(1)
    }

    fn quota(&self) -> Result<Quota, HarvestError> {
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| HarvestError::Config("rate limit burst must be at least 1".into()))?;
        if self.requests_per_second == 0 {
            return Err(HarvestError::Config(
                "requests per second must be greater than 0".into(),
            ));
        }

        Quota::with_period(self.spacing())
            .map(|quota| quota.allow_burst(burst))
            .ok_or_else(|| HarvestError::Config("rate limit period is zero".into()))
    }
}

/// Process-wide request throttle
pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
    queue: Mutex<()>,
    admitted: AtomicU64,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("admitted", &self.admitted())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, HarvestError> {
        let quota = config.quota()?;
        Ok(Self {
            limiter: DefaultDirectRateLimiter::direct(quota),
            queue: Mutex::new(()),
            admitted: AtomicU64::new(0),
            config,
        })
    }

    /// A limiter that effectively never waits, for tests and local sources
    pub fn unthrottled() -> Self {
        let config = RateLimitConfig {
            requests_per_second: 1_000_000,
            burst: 1_000_000,
        };
        // Both values are non-zero, so the quota is always valid.
        let quota = Quota::per_second(NonZeroU32::MIN.saturating_add(999_999))
            .allow_burst(NonZeroU32::MIN.saturating_add(999_999));
        Self {
            limiter: DefaultDirectRateLimiter::direct(quota),
            queue: Mutex::new(()),
            admitted: AtomicU64::new(0),
            config,
        }
    }

    /// Wait until this caller is admitted to issue one request.
    ///
    /// Callers are served in the order they called `acquire`.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        self.limiter.until_ready().await;
        let total = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(admitted = total, "Request admitted");
    }

    /// Total admissions granted since creation
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }
}
