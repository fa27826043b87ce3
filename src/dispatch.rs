use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use std::sync::Arc;

use crate::{
    context::RequestContext,
    error::GatewayError,
    forward::{Forwarder, OutboundBody, UpstreamRequest},
    routes::{Route, RouteTable},
};

/// Match → rewrite → forward for one request.
pub struct Dispatcher {
    routes: RouteTable,
    forwarder: Arc<Forwarder>,
    base_path: String,
}

impl Dispatcher {
    pub fn new(routes: RouteTable, forwarder: Arc<Forwarder>, base_path: impl Into<String>) -> Self {
        Self {
            routes,
            forwarder,
            base_path: base_path.into(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Route for a full public path, or `None` when it is outside the base
    /// path or no prefix covers it.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        let route_path = strip_base_path(&self.base_path, path)?;
        self.routes.match_path(route_path)
    }

    /// `streaming` carries a non-JSON payload that was never buffered;
    /// otherwise the buffered body on `ctx` is used.
    pub fn prepare(
        &self,
        ctx: &RequestContext,
        route: &Route,
        streaming: Option<Body>,
    ) -> UpstreamRequest {
        let mut path_and_query = route.upstream_path(ctx.original_path());
        if let Some(query) = ctx.uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let mut headers = self.forwarder.outbound_headers(ctx, route);
        let body = match streaming {
            Some(stream) => {
                if let Some(length) = ctx.headers.get(CONTENT_LENGTH) {
                    headers.insert(CONTENT_LENGTH, length.clone());
                }
                OutboundBody::Streaming(stream)
            }
            None => {
                let body = outbound_body(&ctx.headers, &ctx.body);
                if body.is_empty() {
                    OutboundBody::Empty
                } else {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                    OutboundBody::Buffered(body)
                }
            }
        };

        UpstreamRequest {
            method: ctx.method.clone(),
            path_and_query,
            headers,
            body,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        streaming: Option<Body>,
    ) -> Response<Body> {
        let Some(route) = self.resolve(ctx.original_path()) else {
            tracing::debug!(
                request_id = %ctx.request_id,
                path = %ctx.original_path(),
                "no route matched"
            );
            return GatewayError::RouteNotFound.into_response();
        };

        ctx.upstream_service = Some(route.service.clone());
        let request = self.prepare(ctx, route, streaming);

        match self.forwarder.forward(route, &ctx.request_id, request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    upstream = %err.service(),
                    outcome = ?err.state(),
                    error = %err,
                    "upstream call failed"
                );
                GatewayError::from(err).into_response()
            }
        }
    }
}

fn strip_base_path<'a>(base_path: &str, path: &'a str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(base_path)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// JSON bodies are re-serialized; anything else, or JSON that does not
/// parse, goes out unchanged.
fn outbound_body(headers: &HeaderMap, body: &Bytes) -> Bytes {
    if body.is_empty() || !is_json(headers) {
        return body.clone();
    }
    match serde_json::from_slice::<serde_json::Value>(body).and_then(|v| serde_json::to_vec(&v)) {
        Ok(serialized) => Bytes::from(serialized),
        Err(err) => {
            tracing::debug!(error = %err, "json body did not parse; forwarding raw bytes");
            body.clone()
        }
    }
}

pub(crate) fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}
