//! Edge gateway for the learning platform: prefix routing, path rewrite and
//! single-attempt forwarding to the backing services.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod identity;
pub mod middleware;
pub mod ratelimit;
pub mod routes;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Json,
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    response::Response,
    routing::{
        any,
        get,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;

pub use config::GatewayConfig;
pub use gateway::Gateway;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

/// `/health` plus a catch-all that runs every other request through the gateway.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(any(proxy_handler))
        .with_state(gateway)
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        service: gateway.service_name().to_string(),
        timestamp: Utc::now(),
    })
}

async fn proxy_handler(State(gateway): State<Arc<Gateway>>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gateway.handle_http(request, client_ip).await
}
