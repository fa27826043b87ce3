//! Best-effort identity derivation from a bearer token.
//!
//! Parsing never fails the request: a missing, malformed, expired or
//! wrongly signed token simply yields no identity.

use http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub email: Option<String>,
    /// Token order, duplicates removed.
    pub roles: Vec<String>,
    pub subscription_tier: Option<String>,
    pub tenant_id: Option<String>,
}

impl Identity {
    /// `X-User-Roles` value.
    pub fn roles_header(&self) -> String {
        serde_json::to_string(&self.roles).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    subscription_tier: Option<String>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    tenant_id: Option<Value>,
}

pub struct IdentityDecoder {
    key: DecodingKey,
    validation: Validation,
}

impl IdentityDecoder {
    pub fn from_secret(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn parse_identity(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(data.claims.into()),
            Err(err) => {
                tracing::debug!(error = %err, "bearer token rejected; continuing without identity");
                None
            }
        }
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        let mut roles: Vec<String> = Vec::new();
        for role in claims.roles.unwrap_or_default().into_iter().chain(claims.role) {
            if !role.is_empty() && !roles.contains(&role) {
                roles.push(role);
            }
        }

        Self {
            user_id: [claims.user_id, claims.id, claims.sub]
                .into_iter()
                .flatten()
                .find_map(scalar_string),
            email: claims.email.filter(|e| !e.is_empty()),
            roles,
            subscription_tier: claims.subscription_tier.or(claims.tier).filter(|t| !t.is_empty()),
            tenant_id: claims.tenant_id.and_then(scalar_string),
        }
    }
}

fn scalar_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Token from `Authorization: Bearer <token>`, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
