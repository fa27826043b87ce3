use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    identity::{IdentityDecoder, bearer_token},
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Derives the caller's identity from a bearer token. Never rejects.
pub struct IdentityMiddleware {
    decoder: Option<IdentityDecoder>,
}

impl IdentityMiddleware {
    pub fn new(jwt_secret: Option<&str>) -> Self {
        if jwt_secret.is_none() {
            tracing::warn!("JWT_SECRET not set; identity headers will not be derived");
        }
        Self {
            decoder: jwt_secret.map(IdentityDecoder::from_secret),
        }
    }
}

#[async_trait]
impl GatewayMiddleware for IdentityMiddleware {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if let Some(decoder) = &self.decoder
            && let Some(token) = bearer_token(&ctx.headers)
        {
            ctx.identity = decoder.parse_identity(token);
            if ctx.identity.is_none() {
                tracing::debug!(request_id = %ctx.request_id, "unverifiable bearer token");
            }
        }
        Ok(ControlFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Uri, header::AUTHORIZATION};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    fn ctx(authorization: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        RequestContext::new(
            "req".to_string(),
            Method::GET,
            Uri::from_static("/api/courses"),
            headers,
            Bytes::new(),
            None,
        )
    }

    #[tokio::test]
    async fn valid_token_populates_identity() {
        let token = encode(
            &Header::default(),
            &json!({ "userId": "u-5", "exp": chrono::Utc::now().timestamp() + 60 }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let middleware = IdentityMiddleware::new(Some("secret"));
        let mut ctx = ctx(Some(&format!("Bearer {token}")));

        assert!(matches!(middleware.on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
        assert_eq!(ctx.identity.unwrap().user_id.as_deref(), Some("u-5"));
    }

    #[tokio::test]
    async fn missing_or_bad_tokens_never_block() {
        let middleware = IdentityMiddleware::new(Some("secret"));
        for auth in [None, Some("Bearer garbage"), Some("Basic Zm9vOmJhcg==")] {
            let mut ctx = ctx(auth);
            assert!(matches!(middleware.on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
            assert!(ctx.identity.is_none());
        }

        let disabled = IdentityMiddleware::new(None);
        let mut ctx = ctx(Some("Bearer anything"));
        assert!(matches!(disabled.on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
        assert!(ctx.identity.is_none());
    }
}
