use async_trait::async_trait;
use redis::{
    Script,
    aio::ConnectionManager,
};
use std::time::Duration;

use crate::{
    error::GatewayResult,
    ratelimit::{RateLimitBackend, RateLimitDecision, RateLimitPolicy},
};

// Returns {count, pttl}. The first hit of a window sets its expiry.
const FIXED_WINDOW_LUA: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Counters shared by every gateway replica.
pub struct RedisRateLimitBackend {
    manager: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisRateLimitBackend {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            script: Script::new(FIXED_WINDOW_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn hit(&self, key: &str, policy: &RateLimitPolicy) -> GatewayResult<RateLimitDecision> {
        let mut conn = self.manager.clone();
        let window_ms = policy.window.as_millis().max(1) as i64;

        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(self.key(key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitDecision::from_count(
            count.max(0) as u64,
            policy,
            Duration::from_millis(ttl_ms.max(0) as u64),
        ))
    }
}
