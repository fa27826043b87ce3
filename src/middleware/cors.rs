use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderValue, Method, StatusCode, header},
    response::Response,
};

use crate::{
    config::CorsConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const DEFAULT_ALLOWED_HEADERS: &str = "Content-Type, Authorization, X-Request-ID";
const MAX_AGE_SECS: &str = "86400";

pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allow_any: bool,
    allow_credentials: bool,
}

impl CorsMiddleware {
    pub fn new(cfg: &CorsConfig) -> Self {
        Self {
            allow_any: cfg.allowed_origins.iter().any(|o| o == "*"),
            allowed_origins: cfg.allowed_origins.clone(),
            allow_credentials: cfg.allow_credentials,
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_any || self.allowed_origins.iter().any(|o| o == origin)
    }

    /// `Access-Control-Allow-Origin` for an allowed origin. Credentialed
    /// responses must echo the origin instead of `*`.
    fn allow_origin_value(&self, origin: &HeaderValue) -> HeaderValue {
        if self.allow_any && !self.allow_credentials {
            HeaderValue::from_static("*")
        } else {
            origin.clone()
        }
    }

    fn apply(&self, origin: &HeaderValue, response: &mut Response<Body>) {
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            self.allow_origin_value(origin),
        );
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        if self.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }

    fn preflight(&self, ctx: &RequestContext, origin: &HeaderValue) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        self.apply(origin, &mut response);

        let requested_headers = ctx
            .headers
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS));

        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested_headers);
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(MAX_AGE_SECS),
        );
        response
    }
}

#[async_trait]
impl GatewayMiddleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let is_preflight = ctx.method == Method::OPTIONS
            && ctx.headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        let Some(origin) = ctx.headers.get(header::ORIGIN).cloned() else {
            return Ok(ControlFlow::Continue);
        };
        if !is_preflight {
            return Ok(ControlFlow::Continue);
        }

        let allowed = origin.to_str().map(|o| self.origin_allowed(o)).unwrap_or(false);
        if !allowed {
            return Err(GatewayError::OriginNotAllowed);
        }
        Ok(ControlFlow::ShortCircuit(self.preflight(ctx, &origin)))
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        let Some(origin) = ctx.headers.get(header::ORIGIN) else {
            return Ok(());
        };
        if origin.to_str().map(|o| self.origin_allowed(o)).unwrap_or(false) {
            self.apply(origin, response);
            response.headers_mut().insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("X-Request-ID"),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Uri};

    use super::*;

    fn middleware(origins: &[&str], allow_credentials: bool) -> CorsMiddleware {
        CorsMiddleware::new(&CorsConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            allow_credentials,
        })
    }

    fn ctx(method: Method, origin: &'static str, preflight: bool) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static(origin));
        if preflight {
            headers.insert(
                header::ACCESS_CONTROL_REQUEST_METHOD,
                HeaderValue::from_static("POST"),
            );
        }
        RequestContext::new(
            "req".to_string(),
            method,
            Uri::from_static("/api/courses"),
            headers,
            Bytes::new(),
            None,
        )
    }

    #[tokio::test]
    async fn preflight_from_allowed_origin_short_circuits() {
        let cors = middleware(&["https://learn.example.com"], true);
        let mut ctx = ctx(Method::OPTIONS, "https://learn.example.com", true);

        let Ok(ControlFlow::ShortCircuit(response)) = cors.on_request(&mut ctx).await else {
            panic!("expected preflight response");
        };
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://learn.example.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
    }

    #[tokio::test]
    async fn preflight_from_unknown_origin_is_rejected() {
        let cors = middleware(&["https://learn.example.com"], true);
        let mut ctx = ctx(Method::OPTIONS, "https://evil.example", true);
        assert!(matches!(
            cors.on_request(&mut ctx).await,
            Err(GatewayError::OriginNotAllowed)
        ));
    }

    #[tokio::test]
    async fn plain_options_without_preflight_headers_passes_through() {
        let cors = middleware(&["https://learn.example.com"], false);
        let mut ctx = ctx(Method::OPTIONS, "https://evil.example", false);
        assert!(matches!(cors.on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
    }

    #[tokio::test]
    async fn simple_response_gets_cors_headers_only_for_allowed_origins() {
        let cors = middleware(&["*"], false);
        let ctx = ctx(Method::GET, "https://anyone.example", false);
        let mut response = Response::new(Body::empty());
        cors.on_response(&ctx, &mut response).await.unwrap();
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS));

        let strict = middleware(&["https://learn.example.com"], true);
        let mut response = Response::new(Body::empty());
        strict.on_response(&ctx, &mut response).await.unwrap();
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
