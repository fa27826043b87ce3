//! Immutable route table: public path prefix → upstream service.
//!
//! Lookups pick the longest registered prefix that covers the path, on
//! segment boundaries. The table is built once and never mutated.

pub mod catalog;

use std::{collections::HashSet, time::Duration};

use regex::{NoExpand, Regex};

use crate::error::RouteTableError;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// One `(prefix, target, rewriteFrom, rewriteTo, timeoutMs)` entry before validation.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub prefix: String,
    pub service: String,
    pub target: String,
    pub rewrite_from: Option<String>,
    pub rewrite_to: String,
    pub timeout_ms: u64,
}

impl RouteSpec {
    pub fn new(
        prefix: impl Into<String>,
        service: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            target: target.into(),
            rewrite_from: None,
            rewrite_to: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite_from = Some(from.into());
        self.rewrite_to = to.into();
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Regex-anchored path rewrite, applied once to the original request path.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pattern: Regex,
    replacement: String,
}

impl PathRewrite {
    pub fn new(from: &str, to: &str) -> Result<Self, RouteTableError> {
        let pattern = Regex::new(from).map_err(|source| RouteTableError::InvalidRewrite {
            pattern: from.to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            replacement: to.to_string(),
        })
    }

    pub fn apply(&self, path: &str) -> String {
        let rewritten = self.pattern.replacen(path, 1, NoExpand(&self.replacement));
        if rewritten.starts_with('/') {
            rewritten.into_owned()
        } else {
            format!("/{rewritten}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub target: String,
    pub rewrite: Option<PathRewrite>,
    pub timeout: Duration,
}

impl Route {
    pub fn covers(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Path sent upstream for `original_path` (query string excluded).
    pub fn upstream_path(&self, original_path: &str) -> String {
        match &self.rewrite {
            Some(rewrite) => rewrite.apply(original_path),
            None => original_path.to_string(),
        }
    }

    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target, path_and_query)
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    // Longest prefix first.
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    pub fn match_path(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.covers(path))
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
    prefixes: HashSet<String>,
}

impl RouteTableBuilder {
    pub fn add_route(&mut self, spec: RouteSpec) -> Result<&mut Self, RouteTableError> {
        let prefix = normalize_prefix(&spec.prefix)?;
        if !self.prefixes.insert(prefix.clone()) {
            return Err(RouteTableError::DuplicateRoute { prefix });
        }

        let target = normalize_target(&spec.service, &spec.target)?;
        let rewrite = spec
            .rewrite_from
            .as_deref()
            .map(|from| PathRewrite::new(from, &spec.rewrite_to))
            .transpose()?;

        self.routes.push(Route {
            prefix,
            service: spec.service,
            target,
            rewrite,
            timeout: Duration::from_millis(spec.timeout_ms.max(1)),
        });
        Ok(self)
    }

    pub fn build(mut self) -> Result<RouteTable, RouteTableError> {
        if self.routes.is_empty() {
            return Err(RouteTableError::Empty);
        }
        // Distinct prefixes of equal length never cover the same path, so
        // length alone decides precedence.
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then(a.prefix.cmp(&b.prefix)));
        Ok(RouteTable {
            routes: self.routes,
        })
    }
}

fn normalize_prefix(raw: &str) -> Result<String, RouteTableError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('/') {
        return Err(RouteTableError::InvalidPrefix {
            prefix: raw.to_string(),
        });
    }
    let stripped = trimmed.trim_end_matches('/');
    Ok(if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    })
}

fn normalize_target(service: &str, raw: &str) -> Result<String, RouteTableError> {
    let invalid = || RouteTableError::InvalidTarget {
        service: service.to_string(),
        target: raw.to_string(),
    };
    let url = reqwest::Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}
