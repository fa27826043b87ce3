use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    error::GatewayResult,
    ratelimit::{RateLimitBackend, RateLimitDecision, RateLimitPolicy},
};

const PURGE_EVERY: u64 = 1024;

/// Per-process counters. Expired windows are swept periodically.
pub struct InMemoryRateLimitBackend {
    windows: DashMap<String, Window>,
    hits: AtomicU64,
}

struct Window {
    started: Instant,
    count: u64,
}

impl InMemoryRateLimitBackend {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            hits: AtomicU64::new(0),
        }
    }

    fn purge_expired(&self, policy: &RateLimitPolicy, now: Instant) {
        self.windows
            .retain(|_, window| now.duration_since(window.started) < policy.window);
    }
}

impl Default for InMemoryRateLimitBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn hit(&self, key: &str, policy: &RateLimitPolicy) -> GatewayResult<RateLimitDecision> {
        let now = Instant::now();
        if self.hits.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(policy, now);
        }

        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= policy.window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;

        let reset_after = policy.window.saturating_sub(now.duration_since(window.started));
        Ok(RateLimitDecision::from_count(window.count, policy, reset_after))
    }
}
