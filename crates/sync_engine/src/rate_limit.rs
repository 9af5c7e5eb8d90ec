//! Request pacing toward the remote API.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until one more request may be sent.
    async fn acquire(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// `0` disables pacing.
    pub permits_per_second: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            permits_per_second: 10.0,
        }
    }
}

impl RateLimitSettings {
    pub fn build(&self) -> Arc<dyn RateLimiter> {
        if self.permits_per_second > 0.0 {
            Arc::new(IntervalRateLimiter::per_second(self.permits_per_second))
        } else {
            Arc::new(Unlimited)
        }
    }
}

/// Spaces requests at least `interval` apart. No bursts.
#[derive(Debug)]
pub struct IntervalRateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl IntervalRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn per_second(permits: f64) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / permits.max(f64::MIN_POSITIVE)))
    }

    fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = next.map_or(now, |at| at.max(now));
        *next = Some(slot + self.interval);
        slot
    }
}

#[async_trait::async_trait]
impl RateLimiter for IntervalRateLimiter {
    async fn acquire(&self) {
        let slot = self.reserve();
        tokio::time::sleep_until(tokio::time::Instant::from_std(slot)).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait::async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self) {}
}
