use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{RateLimitDecision, RateLimiter},
};

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const META_LIMIT: &str = "ratelimit.limit";
const META_REMAINING: &str = "ratelimit.remaining";
const META_RESET: &str = "ratelimit.reset";

/// Fixed-window limit per client address.
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    fail_open_on_error: bool,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RateLimiter, fail_open_on_error: bool) -> Self {
        Self {
            limiter,
            fail_open_on_error,
        }
    }

    fn resolve_key(ctx: &RequestContext) -> String {
        ctx.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    fn limited_response(decision: &RateLimitDecision) -> Response<Body> {
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.reset_after_secs,
        }
        .into_response();
        set_headers(
            &mut response,
            &decision.limit.to_string(),
            &decision.remaining.to_string(),
            &decision.reset_after_secs.to_string(),
        );
        response
    }
}

fn set_headers(response: &mut Response<Body>, limit: &str, remaining: &str, reset: &str) {
    for (name, value) in [
        (RATELIMIT_LIMIT, limit),
        (RATELIMIT_REMAINING, remaining),
        (RATELIMIT_RESET, reset),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(name, value);
        }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let key = Self::resolve_key(ctx);

        match self.limiter.check(&key).await {
            Ok(decision) if decision.allowed => {
                ctx.metadata
                    .insert(META_LIMIT.to_string(), decision.limit.to_string());
                ctx.metadata
                    .insert(META_REMAINING.to_string(), decision.remaining.to_string());
                ctx.metadata
                    .insert(META_RESET.to_string(), decision.reset_after_secs.to_string());
                Ok(ControlFlow::Continue)
            }
            Ok(decision) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    client = %key,
                    retry_after_secs = decision.reset_after_secs,
                    "rate limit exceeded"
                );
                Ok(ControlFlow::ShortCircuit(Self::limited_response(&decision)))
            }
            Err(err) if self.fail_open_on_error => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err,
                    "rate limiter backend failed; allowing request because fail-open is enabled"
                );
                Ok(ControlFlow::Continue)
            }
            Err(err) => {
                tracing::error!(request_id = %ctx.request_id, error = %err, "rate limiter backend failed");
                Err(GatewayError::Internal(
                    "rate limiter backend unavailable".to_string(),
                ))
            }
        }
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if let (Some(limit), Some(remaining), Some(reset)) = (
            ctx.metadata.get(META_LIMIT),
            ctx.metadata.get(META_REMAINING),
            ctx.metadata.get(META_RESET),
        ) {
            set_headers(response, limit, remaining, reset);
        }
        Ok(())
    }
}
