use anyhow::{Context, Result, anyhow};
use std::{env, net::SocketAddr};

use crate::routes::DEFAULT_TIMEOUT_MS;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub base_path: String,
    pub service_name: String,
    pub services: ServiceEndpoints,
    pub default_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub identity: IdentityConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
}

/// Base URL and timeout of every backend the gateway fronts.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub user: ServiceEndpoint,
    pub course: ServiceEndpoint,
    pub lab: ServiceEndpoint,
    pub payment: ServiceEndpoint,
    pub admin: ServiceEndpoint,
    pub marketing: ServiceEndpoint,
    pub community: ServiceEndpoint,
}

#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub jwt_secret: Option<String>,
    pub tenant_header: String,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: RateLimitBackendConfig,
    pub window_ms: u64,
    pub max_requests: u64,
    pub fail_open_on_error: bool,
}

#[derive(Debug, Clone)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

// (env prefix, service name, fallback base URL)
const SERVICE_DEFAULTS: [(&str, &str, &str); 7] = [
    ("USER", "user-service", "http://user-service:3001"),
    ("COURSE", "course-service", "http://course-service:3002"),
    ("LAB", "lab-service", "http://lab-service:3003"),
    ("PAYMENT", "payment-service", "http://payment-service:3004"),
    ("ADMIN", "admin-service", "http://admin-service:3005"),
    ("MARKETING", "marketing-service", "http://marketing-service:3006"),
    ("COMMUNITY", "community-service", "http://community-service:3007"),
];

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };

        let bind_addr = match source.get("BIND_ADDR") {
            Some(addr) => addr,
            None => format!("0.0.0.0:{}", source.parse("PORT", 3000u16)),
        }
        .parse::<SocketAddr>()
        .context("invalid BIND_ADDR")?;

        let base_path = normalize_base_path(&source.string("API_BASE_PATH", "/api"))?;
        let default_timeout_ms = source.parse("UPSTREAM_TIMEOUT_MS", DEFAULT_TIMEOUT_MS).max(1);

        let endpoint = |idx: usize| {
            let (key, name, fallback) = SERVICE_DEFAULTS[idx];
            ServiceEndpoint {
                name: name.to_string(),
                base_url: source
                    .string(&format!("{key}_SERVICE_URL"), fallback)
                    .trim_end_matches('/')
                    .to_string(),
                timeout_ms: source
                    .parse(&format!("{key}_SERVICE_TIMEOUT_MS"), default_timeout_ms)
                    .max(1),
            }
        };
        let services = ServiceEndpoints {
            user: endpoint(0),
            course: endpoint(1),
            lab: endpoint(2),
            payment: endpoint(3),
            admin: endpoint(4),
            marketing: endpoint(5),
            community: endpoint(6),
        };

        let identity = IdentityConfig {
            jwt_secret: source.get("JWT_SECRET").filter(|s| !s.is_empty()),
            tenant_header: source.string("TENANT_HEADER", "x-tenant-id").to_ascii_lowercase(),
        };

        let cors = CorsConfig {
            allowed_origins: source.csv("CORS_ORIGINS", "http://localhost:3000"),
            allow_credentials: source.parse("CORS_ALLOW_CREDENTIALS", true),
        };

        let backend = match source.string("RATE_LIMIT_BACKEND", "memory").to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => RateLimitBackendConfig::InMemory,
            "redis" => RateLimitBackendConfig::Redis {
                url: source.string("REDIS_URL", "redis://127.0.0.1:6379"),
                key_prefix: source.string("REDIS_KEY_PREFIX", "gateway:ratelimit"),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let rate_limit = RateLimitConfig {
            enabled: source.parse("RATE_LIMIT_ENABLED", true),
            backend,
            window_ms: source.parse("RATE_LIMIT_WINDOW_MS", 15 * 60 * 1000u64).max(1),
            max_requests: source.parse("RATE_LIMIT_MAX", 100u64),
            fail_open_on_error: source.parse("RATE_LIMIT_FAIL_OPEN", true),
        };

        Ok(Self {
            bind_addr,
            base_path,
            service_name: source.string("GATEWAY_SERVICE_NAME", "api-gateway"),
            services,
            default_timeout_ms,
            max_body_bytes: source.parse("MAX_BODY_BYTES", 10 * 1024 * 1024usize),
            identity,
            cors,
            rate_limit,
        })
    }
}

struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn csv(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr,
    {
        self.get(key)
            .and_then(|s| s.parse::<T>().ok())
            .unwrap_or(default)
    }
}

fn normalize_base_path(raw: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(anyhow!("API_BASE_PATH must start with '/': {raw}"));
    }
    Ok(raw.trim_end_matches('/').to_string())
}
