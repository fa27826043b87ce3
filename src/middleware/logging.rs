use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let status = response.status();
        let latency_ms = ctx.started_at.elapsed().as_millis();
        let user_id = ctx.identity.as_ref().and_then(|i| i.user_id.as_deref());

        // 502s are already logged with their cause by the dispatcher.
        if status.is_server_error() {
            tracing::warn!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = %status,
                upstream = ?ctx.upstream_service,
                latency_ms = latency_ms,
                "request failed"
            );
        } else {
            tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = %status,
                upstream = ?ctx.upstream_service,
                user_id = ?user_id,
                latency_ms = latency_ms,
                "request completed"
            );
        }
        Ok(())
    }
}
