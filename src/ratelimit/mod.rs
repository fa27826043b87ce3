//! Fixed-window request counting per client key.

pub mod in_memory;
pub mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::GatewayResult;

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_secs: u64,
}

impl RateLimitDecision {
    /// Decision for the `count`-th hit of a window that resets in `reset_after`.
    pub fn from_count(count: u64, policy: &RateLimitPolicy, reset_after: Duration) -> Self {
        Self {
            allowed: count <= policy.max_requests,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            reset_after_secs: reset_after.as_secs_f64().ceil().max(1.0) as u64,
        }
    }
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Counts one hit for `key` and reports the resulting window state.
    async fn hit(&self, key: &str, policy: &RateLimitPolicy) -> GatewayResult<RateLimitDecision>;
}

#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, policy: RateLimitPolicy) -> Self {
        Self { backend, policy }
    }

    pub async fn check(&self, key: &str) -> GatewayResult<RateLimitDecision> {
        self.backend.hit(key, &self.policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_counts_down_and_blocks_past_the_limit() {
        let policy = RateLimitPolicy {
            window: Duration::from_secs(60),
            max_requests: 2,
        };
        let first = RateLimitDecision::from_count(1, &policy, Duration::from_millis(59_500));
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.reset_after_secs, 60);

        let third = RateLimitDecision::from_count(3, &policy, Duration::from_millis(10));
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.reset_after_secs, 1);
    }
}
