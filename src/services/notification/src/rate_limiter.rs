//! Per-user throughput limiting
//!
//! [`SlidingWindowLimiter`] keeps the exact send timestamps of the trailing
//! window per user. [`StoreBackedLimiter`] trades exactness for a shared
//! counter so several engine instances see the same budget.

use crate::error::Result;
use crate::store::KvStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// `retry_at` is the earliest instant a slot frees up, when known.
    Rejected { retry_at: Option<DateTime<Utc>> },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record a send attempt for `user_id` if it fits within `limit`.
    async fn check(&self, user_id: &str, limit: u32, now: DateTime<Utc>) -> Result<RateDecision>;

    /// Forget users with nothing left in the window. Returns how many went.
    async fn purge(&self, _now: DateTime<Utc>) -> usize {
        0
    }

    fn backend(&self) -> &'static str;
}

fn one_hour() -> Duration {
    Duration::hours(1)
}

/// Exact sliding window over `(now - window, now]`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    sends: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::with_window(one_hour())
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            sends: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Slots left for `user_id` at `now`, without recording anything.
    pub fn remaining(&self, user_id: &str, limit: u32, now: DateTime<Utc>) -> u32 {
        let cutoff = now - self.window;
        let used = self
            .sends
            .get(user_id)
            .map(|sends| sends.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0);
        limit.saturating_sub(used as u32)
    }

    /// Drop users with no sends inside the window. Returns how many were dropped.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.sends.len();
        self.sends
            .retain(|_, sends| sends.back().map(|t| *t > cutoff).unwrap_or(false));
        before - self.sends.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.sends.len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, user_id: &str, limit: u32, now: DateTime<Utc>) -> Result<RateDecision> {
        let cutoff = now - self.window;
        // Holds only this user's shard lock.
        let mut sends = self.sends.entry(user_id.to_string()).or_default();

        while sends.front().map(|t| *t <= cutoff).unwrap_or(false) {
            sends.pop_front();
        }

        if sends.len() >= limit as usize {
            let retry_at = sends.front().map(|oldest| *oldest + self.window);
            debug!(
                "User {} at {} sends in window (limit {})",
                user_id,
                sends.len(),
                limit
            );
            return Ok(RateDecision::Rejected { retry_at });
        }

        sends.push_back(now);
        Ok(RateDecision::Allowed {
            remaining: limit - sends.len() as u32,
        })
    }

    async fn purge(&self, now: DateTime<Utc>) -> usize {
        let purged = self.purge_idle(now);
        if purged > 0 {
            debug!("Purged rate-limit state for {} idle users", purged);
        }
        purged
    }

    fn backend(&self) -> &'static str {
        "sliding_window"
    }
}

/// Fixed-bucket counter over a shared [`KvStore`].
///
/// Each user gets one counter per window-aligned bucket, expiring with the
/// bucket. Rejected attempts still increment the counter, and a burst that
/// straddles a bucket boundary may see up to twice the limit.
pub struct StoreBackedLimiter {
    store: Arc<dyn KvStore>,
    window: Duration,
}

impl StoreBackedLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            window: one_hour(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn bucket(&self, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
        let size = self.window.num_seconds().max(1);
        let bucket = now.timestamp().div_euclid(size);
        let ends_at = Utc
            .timestamp_opt((bucket + 1) * size, 0)
            .single()
            .unwrap_or(now + self.window);
        (bucket, ends_at)
    }
}

#[async_trait]
impl RateLimiter for StoreBackedLimiter {
    async fn check(&self, user_id: &str, limit: u32, now: DateTime<Utc>) -> Result<RateDecision> {
        let (bucket, ends_at) = self.bucket(now);
        let key = format!("rate:{}:{}", user_id, bucket);

        let count = self.store.incr(&key).await?;
        if count == 1 {
            let ttl = self
                .window
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(3600));
            self.store.expire(&key, ttl).await?;
        }

        if count > i64::from(limit) {
            return Ok(RateDecision::Rejected {
                retry_at: Some(ends_at),
            });
        }

        Ok(RateDecision::Allowed {
            remaining: (i64::from(limit) - count) as u32,
        })
    }

    fn backend(&self) -> &'static str {
        "shared_store"
    }
}
