//! Upstream calls: header assembly, bounded single attempt, streamed relay.
//!
//! A forwarded request moves `Dispatched → AwaitingUpstream` and ends in
//! exactly one of `Relayed`, `TimedOut` or `ConnectionFailed`. There is no
//! retry transition.

use axum::{body::Body, response::Response};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt, channel::mpsc, stream};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{CONTENT_LENGTH, HOST},
};
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    routes::Route,
};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");
pub const X_SUBSCRIPTION_TIER: HeaderName = HeaderName::from_static("x-subscription-tier");
pub const X_SERVICE_NAME: HeaderName = HeaderName::from_static("x-service-name");
pub const X_FORWARDED_SERVICE: HeaderName = HeaderName::from_static("x-forwarded-service");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

// Only the gateway may assert these.
const DERIVED_IDENTITY_HEADERS: [HeaderName; 4] =
    [X_USER_ID, X_USER_EMAIL, X_USER_ROLES, X_SUBSCRIPTION_TIER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Dispatched,
    AwaitingUpstream,
    Relayed,
    TimedOut,
    ConnectionFailed,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{service} did not respond within {timeout_ms}ms")]
    TimedOut { service: String, timeout_ms: u64 },
    #[error("{service} unreachable: {reason}")]
    ConnectionFailed { service: String, reason: String },
}

impl ForwardError {
    pub fn service(&self) -> &str {
        match self {
            Self::TimedOut { service, .. } | Self::ConnectionFailed { service, .. } => service,
        }
    }

    pub fn state(&self) -> ForwardState {
        match self {
            Self::TimedOut { .. } => ForwardState::TimedOut,
            Self::ConnectionFailed { .. } => ForwardState::ConnectionFailed,
        }
    }
}

impl From<ForwardError> for GatewayError {
    fn from(err: ForwardError) -> Self {
        Self::UpstreamUnavailable {
            service: err.service().to_string(),
        }
    }
}

/// Raised inside a relayed body once the status line has gone out. It
/// aborts the stream and is never turned into a second response.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("response from {service} already started; stream interrupted: {reason}")]
    ResponseAlreadySent { service: String, reason: String },
}

/// Request as it leaves the gateway.
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: OutboundBody,
}

pub enum OutboundBody {
    Empty,
    /// Re-serialized JSON.
    Buffered(Bytes),
    /// Any other payload, relayed chunk by chunk as the client sends it.
    Streaming(Body),
}

impl OutboundBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    fn into_reqwest(self) -> Option<reqwest::Body> {
        match self {
            Self::Empty => None,
            Self::Buffered(bytes) => Some(reqwest::Body::from(bytes)),
            Self::Streaming(body) => Some(upload_stream(body)),
        }
    }
}

const UPLOAD_CHANNEL_CAPACITY: usize = 8;

// reqwest wants a `Sync` stream and the inbound body is not; a bounded
// channel bridges the two and keeps backpressure on the client.
fn upload_stream(body: Body) -> reqwest::Body {
    let (mut tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(UPLOAD_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut inbound = body.into_data_stream();
        while let Some(chunk) = inbound.next().await {
            let chunk = chunk.map_err(std::io::Error::other);
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(rx)
}

#[derive(Default)]
struct ServiceStats {
    in_flight: AtomicU64,
    relayed: AtomicU64,
    timed_out: AtomicU64,
    connection_failed: AtomicU64,
    interrupted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub in_flight: u64,
    pub relayed: u64,
    pub timed_out: u64,
    pub connection_failed: u64,
    pub interrupted: u64,
}

pub struct Forwarder {
    client: reqwest::Client,
    gateway_name: String,
    tenant_header: HeaderName,
    stats: DashMap<String, Arc<ServiceStats>>,
}

impl Forwarder {
    pub fn new(gateway_name: &str, tenant_header: &str) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let tenant_header = HeaderName::from_bytes(tenant_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-tenant-id"));

        Ok(Self {
            client,
            gateway_name: gateway_name.to_string(),
            tenant_header,
            stats: DashMap::new(),
        })
    }

    /// Inbound headers minus hop-by-hop and spoofable identity headers,
    /// plus the derived identity and correlation set.
    pub fn outbound_headers(&self, ctx: &RequestContext, route: &Route) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(ctx.headers.len() + 10);
        for (name, value) in &ctx.headers {
            if is_hop_by_hop(name)
                || *name == HOST
                || *name == CONTENT_LENGTH
                || DERIVED_IDENTITY_HEADERS.contains(name)
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(identity) = &ctx.identity {
            if let Some(user_id) = &identity.user_id {
                insert_text(&mut headers, X_USER_ID, user_id);
            }
            if let Some(email) = &identity.email {
                insert_text(&mut headers, X_USER_EMAIL, email);
            }
            insert_text(&mut headers, X_USER_ROLES, &identity.roles_header());
            if let Some(tier) = &identity.subscription_tier {
                insert_text(&mut headers, X_SUBSCRIPTION_TIER, tier);
            }
            if let Some(tenant) = &identity.tenant_id
                && !headers.contains_key(&self.tenant_header)
            {
                insert_text(&mut headers, self.tenant_header.clone(), tenant);
            }
        }

        insert_text(&mut headers, X_REQUEST_ID, &ctx.request_id);
        insert_text(&mut headers, X_SERVICE_NAME, &self.gateway_name);
        insert_text(&mut headers, X_FORWARDED_SERVICE, &route.service);

        if let Some(ip) = ctx.client_ip {
            let mut chain: Vec<String> = headers
                .get_all(&X_FORWARDED_FOR)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            chain.push(ip.to_string());
            let chain = chain.join(", ");
            insert_text(&mut headers, X_FORWARDED_FOR, &chain);
        }
        if let Some(host) = ctx.headers.get(HOST)
            && !headers.contains_key(&X_FORWARDED_HOST)
        {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        headers
    }

    pub async fn forward(
        &self,
        route: &Route,
        request_id: &str,
        request: UpstreamRequest,
    ) -> Result<Response<Body>, ForwardError> {
        let stats = self.stats_for(&route.service);
        let url = route.upstream_url(&request.path_and_query);

        tracing::debug!(
            request_id = %request_id,
            upstream = %route.service,
            method = %request.method,
            url = %url,
            state = ?ForwardState::Dispatched,
            "forwarding request"
        );

        let mut builder = self
            .client
            .request(request.method, &url)
            .headers(request.headers);
        if let Some(body) = request.body.into_reqwest() {
            builder = builder.body(body);
        }
        let pending = builder.send();

        let started = Instant::now();
        let outcome = {
            let _in_flight = InFlight::enter(&stats);
            tracing::trace!(request_id = %request_id, state = ?ForwardState::AwaitingUpstream);
            tokio::time::timeout(route.timeout, pending).await
        };

        let upstream = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                stats.connection_failed.fetch_add(1, Ordering::Relaxed);
                return Err(ForwardError::ConnectionFailed {
                    service: route.service.clone(),
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                stats.timed_out.fetch_add(1, Ordering::Relaxed);
                return Err(ForwardError::TimedOut {
                    service: route.service.clone(),
                    timeout_ms: route.timeout.as_millis() as u64,
                });
            }
        };

        stats.relayed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            request_id = %request_id,
            upstream = %route.service,
            status = %upstream.status(),
            latency_ms = started.elapsed().as_millis(),
            state = ?ForwardState::Relayed,
            "upstream responded"
        );

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();

        let guard = RelayGuard {
            service: route.service.clone(),
            request_id: request_id.to_string(),
            stats,
        };
        // The route timeout also bounds every gap between body chunks.
        let idle = route.timeout;
        let chunks = Box::pin(upstream.bytes_stream());
        let stream = stream::unfold(Some((chunks, guard)), move |state| async move {
            let (mut chunks, guard) = state?;
            match tokio::time::timeout(idle, chunks.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some((chunks, guard)))),
                Ok(Some(Err(err))) => Some((Err(guard.interrupted(err)), None)),
                Ok(None) => None,
                Err(_) => {
                    let reason = format!("no data for {}ms", idle.as_millis());
                    Some((Err(guard.interrupted(reason)), None))
                }
            }
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        for (name, value) in &upstream_headers {
            if !is_hop_by_hop(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        Ok(response)
    }

    pub fn snapshot(&self, service: &str) -> ServiceSnapshot {
        self.stats
            .get(service)
            .map(|stats| ServiceSnapshot {
                in_flight: stats.in_flight.load(Ordering::Relaxed),
                relayed: stats.relayed.load(Ordering::Relaxed),
                timed_out: stats.timed_out.load(Ordering::Relaxed),
                connection_failed: stats.connection_failed.load(Ordering::Relaxed),
                interrupted: stats.interrupted.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stats.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn stats_for(&self, service: &str) -> Arc<ServiceStats> {
        self.stats
            .entry(service.to_string())
            .or_default()
            .clone()
    }
}

struct InFlight<'a>(&'a ServiceStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a ServiceStats) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct RelayGuard {
    service: String,
    request_id: String,
    stats: Arc<ServiceStats>,
}

impl RelayGuard {
    fn interrupted(&self, reason: impl Display) -> std::io::Error {
        self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
        let err = RelayError::ResponseAlreadySent {
            service: self.service.clone(),
            reason: reason.to_string(),
        };
        tracing::warn!(
            request_id = %self.request_id,
            upstream = %self.service,
            error = %err,
            "upstream body failed mid-stream; no error response written"
        );
        std::io::Error::other(err)
    }
}

fn insert_text(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::debug!(header = %name, "dropping header with non-visible characters"),
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use axum::body::to_bytes;
    use http::{Uri, header::AUTHORIZATION};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        identity::Identity,
        routes::{RouteSpec, RouteTable},
    };

    fn route(target: &str, timeout_ms: u64) -> Route {
        let mut builder = RouteTable::builder();
        builder
            .add_route(RouteSpec::new("/courses", "course-service", target).timeout_ms(timeout_ms))
            .unwrap();
        builder.build().unwrap().match_path("/courses").unwrap().clone()
    }

    fn ctx(headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            "req-1".to_string(),
            Method::GET,
            Uri::from_static("/api/courses"),
            headers,
            Bytes::new(),
            Some("10.1.2.3".parse::<IpAddr>().unwrap()),
        )
    }

    fn forwarder() -> Forwarder {
        Forwarder::new("api-gateway", "x-tenant-id").unwrap()
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            method: Method::GET,
            path_and_query: "/courses".to_string(),
            headers: HeaderMap::new(),
            body: OutboundBody::Empty,
        }
    }

    #[test]
    fn authorization_and_correlation_headers_are_forwarded() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer X"));
        inbound.insert(HOST, HeaderValue::from_static("learn.example.com"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let headers = forwarder().outbound_headers(&ctx(inbound), &route("http://c:1", 1000));

        assert_eq!(headers[AUTHORIZATION], "Bearer X");
        assert_eq!(headers[X_REQUEST_ID], "req-1");
        assert_eq!(headers[X_SERVICE_NAME], "api-gateway");
        assert_eq!(headers[X_FORWARDED_SERVICE], "course-service");
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3");
        assert_eq!(headers["x-forwarded-host"], "learn.example.com");
        assert_eq!(headers["x-custom"], "kept");
        assert!(!headers.contains_key(HOST));
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key(X_USER_ID));
        assert!(!headers.contains_key(X_USER_ROLES));
    }

    #[test]
    fn derived_identity_replaces_client_supplied_identity() {
        let mut inbound = HeaderMap::new();
        inbound.insert(X_USER_ID, HeaderValue::from_static("spoofed"));
        inbound.insert(X_SUBSCRIPTION_TIER, HeaderValue::from_static("enterprise"));
        let mut ctx = ctx(inbound);
        ctx.identity = Some(Identity {
            user_id: Some("u-42".to_string()),
            email: Some("grace@example.com".to_string()),
            roles: vec!["student".to_string()],
            subscription_tier: None,
            tenant_id: Some("acme".to_string()),
        });

        let headers = forwarder().outbound_headers(&ctx, &route("http://c:1", 1000));

        assert_eq!(headers[X_USER_ID], "u-42");
        assert_eq!(headers[X_USER_EMAIL], "grace@example.com");
        assert_eq!(headers[X_USER_ROLES], r#"["student"]"#);
        assert!(!headers.contains_key(X_SUBSCRIPTION_TIER));
        assert_eq!(headers["x-tenant-id"], "acme");
    }

    #[test]
    fn inbound_tenant_header_wins_over_token_tenant() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-tenant-id", HeaderValue::from_static("globex"));
        let mut ctx = ctx(inbound);
        ctx.identity = Some(Identity {
            tenant_id: Some("acme".to_string()),
            ..Identity::default()
        });

        let headers = forwarder().outbound_headers(&ctx, &route("http://c:1", 1000));
        assert_eq!(headers["x-tenant-id"], "globex");
    }

    #[test]
    fn forwarded_for_chain_is_extended() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let headers = forwarder().outbound_headers(&ctx(inbound), &route("http://c:1", 1000));
        assert_eq!(headers["x-forwarded-for"], "203.0.113.9, 10.1.2.3");
    }

    #[test]
    fn every_forwarded_for_line_is_kept() {
        let mut inbound = HeaderMap::new();
        inbound.append("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        inbound.append("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 192.0.2.4"));
        let headers = forwarder().outbound_headers(&ctx(inbound), &route("http://c:1", 1000));
        assert_eq!(headers.get_all("x-forwarded-for").iter().count(), 1);
        assert_eq!(
            headers["x-forwarded-for"],
            "198.51.100.1, 203.0.113.9, 192.0.2.4, 10.1.2.3"
        );
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = forwarder();
        let err = forwarder
            .forward(&route(&format!("http://{addr}"), 5_000), "req-1", request())
            .await
            .unwrap_err();

        assert_eq!(err.state(), ForwardState::ConnectionFailed);
        assert_eq!(err.service(), "course-service");
        let snapshot = forwarder.snapshot("course-service");
        assert_eq!(snapshot.connection_failed, 1);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let forwarder = forwarder();
        let started = Instant::now();
        let err = forwarder
            .forward(&route(&format!("http://{addr}"), 150), "req-1", request())
            .await
            .unwrap_err();

        assert_eq!(err.state(), ForwardState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(forwarder.snapshot("course-service").timed_out, 1);

        let gateway_err: GatewayError = err.into();
        assert_eq!(gateway_err.status(), http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn stalled_body_is_cut_after_the_route_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n0123456789")
                    .await;
                held.push(socket);
            }
        });

        let forwarder = forwarder();
        let response = forwarder
            .forward(&route(&format!("http://{addr}"), 150), "req-1", request())
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);

        let read = tokio::time::timeout(Duration::from_secs(3), to_bytes(response.into_body(), usize::MAX))
            .await
            .expect("relay should give up on a stalled upstream");
        assert!(read.is_err());

        let snapshot = forwarder.snapshot("course-service");
        assert_eq!(snapshot.interrupted, 1);
        assert_eq!(snapshot.timed_out, 0);
    }

    #[tokio::test]
    async fn streaming_body_reaches_the_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !received.ends_with(b"upload-payload") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            let _ = socket
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await;
            let _ = seen_tx.send(received);
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("14"));
        let request = UpstreamRequest {
            method: Method::POST,
            path_and_query: "/courses/upload".to_string(),
            headers,
            body: OutboundBody::Streaming(Body::from("upload-payload")),
        };

        let response = forwarder()
            .forward(&route(&format!("http://{addr}"), 2_000), "req-1", request)
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);

        let received = String::from_utf8(seen_rx.await.unwrap()).unwrap();
        assert!(received.starts_with("POST /courses/upload HTTP/1.1"));
        assert!(received.to_ascii_lowercase().contains("content-length: 14"));
        assert!(received.ends_with("upload-payload"));
    }
}
