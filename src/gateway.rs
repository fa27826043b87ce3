use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{
        Body,
        Bytes,
        HttpBody,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    config::{
        GatewayConfig,
        RateLimitBackendConfig,
    },
    context::RequestContext,
    dispatch::{
        Dispatcher,
        is_json,
    },
    error::GatewayError,
    forward::{
        Forwarder,
        X_REQUEST_ID,
    },
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        cors::CorsMiddleware,
        identity::IdentityMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        RateLimitBackend,
        RateLimitPolicy,
        RateLimiter,
        in_memory::InMemoryRateLimitBackend,
        redis_backend::RedisRateLimitBackend,
    },
    routes::{
        RouteTable,
        catalog::platform_routes,
    },
};

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    dispatcher: Dispatcher,
    max_body_bytes: usize,
    service_name: String,
}

impl Gateway {
    /// Builds the platform route table and the request pipeline. Any route
    /// table error aborts startup.
    pub async fn init(config: &GatewayConfig) -> anyhow::Result<Self> {
        let routes = platform_routes(config).context("invalid route table")?;
        Self::with_routes(config, routes).await
    }

    pub async fn with_routes(config: &GatewayConfig, routes: RouteTable) -> anyhow::Result<Self> {
        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(CorsMiddleware::new(&config.cors)),
        ];

        if config.rate_limit.enabled {
            let backend: Arc<dyn RateLimitBackend> = match &config.rate_limit.backend {
                RateLimitBackendConfig::InMemory => Arc::new(InMemoryRateLimitBackend::new()),
                RateLimitBackendConfig::Redis { url, key_prefix } => Arc::new(
                    RedisRateLimitBackend::new(url.clone(), key_prefix.clone())
                        .await
                        .context("failed to connect rate limit backend")?,
                ),
            };
            let policy = RateLimitPolicy {
                window: Duration::from_millis(config.rate_limit.window_ms),
                max_requests: config.rate_limit.max_requests,
            };
            middlewares.push(Arc::new(RateLimitMiddleware::new(
                RateLimiter::new(backend, policy),
                config.rate_limit.fail_open_on_error,
            )));
        }

        middlewares.push(Arc::new(IdentityMiddleware::new(
            config.identity.jwt_secret.as_deref(),
        )));

        let forwarder = Forwarder::new(&config.service_name, &config.identity.tenant_header)
            .context("failed to build upstream client")?;

        for route in routes.routes() {
            tracing::info!(
                prefix = %route.prefix,
                upstream = %route.service,
                target = %route.target,
                timeout_ms = route.timeout.as_millis() as u64,
                "route registered"
            );
        }

        Ok(Self {
            middlewares,
            dispatcher: Dispatcher::new(routes, Arc::new(forwarder), config.base_path.clone()),
            max_body_bytes: config.max_body_bytes,
            service_name: config.service_name.clone(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // JSON is buffered for re-serialization and therefore capped. Every
        // other payload is streamed to the upstream untouched.
        let (body, streaming) = if is_json(&parts.headers) {
            match to_bytes(body, self.max_body_bytes).await {
                Ok(body) => (body, None),
                Err(_) => {
                    let mut response = GatewayError::PayloadTooLarge.into_response();
                    self.attach_hardening_headers(&request_id, &mut response);
                    return response;
                }
            }
        } else if body.is_end_stream() {
            (Bytes::new(), None)
        } else {
            (Bytes::new(), Some(body))
        };

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        let response = self.dispatcher.dispatch(&mut ctx, streaming).await;
        self.finish(&executed, &ctx, response).await
    }

    /// Logs per-service outcome counters. In-flight upstream calls are not
    /// awaited here; the server drains connections before this runs.
    pub fn shutdown(&self) {
        let forwarder = self.dispatcher.forwarder();
        for service in forwarder.services() {
            let snapshot = forwarder.snapshot(&service);
            tracing::info!(
                upstream = %service,
                relayed = snapshot.relayed,
                timed_out = snapshot.timed_out,
                connection_failed = snapshot.connection_failed,
                interrupted = snapshot.interrupted,
                in_flight = snapshot.in_flight,
                "upstream summary"
            );
        }
        tracing::info!(service = %self.service_name, "gateway stopped");
    }

    async fn finish(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        self.apply_response_middlewares(executed, ctx, &mut response)
            .await;
        self.attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }

    /// Upstream-provided values win; the gateway only fills gaps.
    fn attach_hardening_headers(&self, request_id: &str, response: &mut Response<Body>) {
        let headers = response.headers_mut();
        if !headers.contains_key(X_REQUEST_ID)
            && let Ok(value) = HeaderValue::from_str(request_id)
        {
            headers.insert(X_REQUEST_ID, value);
        }

        for (name, value) in [
            ("x-content-type-options", "nosniff"),
            ("x-frame-options", "DENY"),
            ("referrer-policy", "no-referrer"),
        ] {
            headers
                .entry(HeaderName::from_static(name))
                .or_insert(HeaderValue::from_static(value));
        }
    }
}
