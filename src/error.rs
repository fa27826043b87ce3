use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "Service temporarily unavailable";

/// Per-request failures. Every variant renders as the uniform envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route not found")]
    RouteNotFound,
    #[error("upstream {service} unavailable")]
    UpstreamUnavailable { service: String },
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("origin not allowed")]
    OriginNotAllowed,
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while building the route table. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum RouteTableError {
    #[error("duplicate route prefix {prefix}")]
    DuplicateRoute { prefix: String },
    #[error("invalid route prefix {prefix:?}: must start with '/'")]
    InvalidPrefix { prefix: String },
    #[error("invalid upstream target {target:?} for {service}")]
    InvalidTarget { service: String, target: String },
    #[error("invalid rewrite pattern {pattern:?}")]
    InvalidRewrite {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("no routes configured")]
    Empty,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, service: Option<String>) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                message: message.into(),
                service,
            },
        }
    }
}

impl GatewayError {
    /// Client-facing message. Operator-controlled text only.
    pub fn message(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "Route not found",
            Self::UpstreamUnavailable { .. } => UPSTREAM_UNAVAILABLE_MESSAGE,
            Self::RateLimited { .. } => "Too many requests, please try again later.",
            Self::OriginNotAllowed => "Not allowed by CORS",
            Self::PayloadTooLarge => "Request entity too large",
            Self::Internal(_) => "Internal server error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let service = match self {
            Self::UpstreamUnavailable { service } => Some(service.clone()),
            _ => None,
        };
        ErrorEnvelope::new(self.message(), service)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.envelope())).into_response();

        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }

        response
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Internal(err.to_string())
    }
}
