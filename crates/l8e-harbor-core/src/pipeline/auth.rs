//! `auth` middleware: delegates to a pluggable [`AuthAdapter`], checks
//! required roles, and exempts configured anonymous paths. The adapter
//! seam is the swap point named in the external-interface contract —
//! concrete adapters (JWT here; OIDC, mTLS-identity, etc. elsewhere) are
//! the only thing that differs between deployments.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::error::MiddlewareError;
use crate::observability::AuthAttemptEvent;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The resolved caller identity an [`AuthAdapter`] hands back on success.
pub struct AuthIdentity {
    pub subject: String,
    pub roles: Vec<String>,
}

/// `authenticate(headers, cookies) -> identity | Unauthenticated`. Kept as
/// a small interface with a single method, no inheritance, so a deployment
/// can swap in an OIDC or mTLS-identity adapter without touching
/// `AuthMiddleware` itself.
pub trait AuthAdapter: Send + Sync {
    fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
    ) -> Option<AuthIdentity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    exp: usize,
}

/// Bearer-JWT adapter: verifies the `Authorization: Bearer <token>` header
/// against a secret pulled from `L8E_JWT_SECRET` at construction time
/// (not embedded in route config).
pub struct JwtAuthAdapter {
    secret: String,
}

impl JwtAuthAdapter {
    pub fn from_env() -> Self {
        Self {
            secret: std::env::var("L8E_JWT_SECRET").unwrap_or_default(),
        }
    }
}

impl AuthAdapter for JwtAuthAdapter {
    fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        _cookies: &HashMap<String, String>,
    ) -> Option<AuthIdentity> {
        let token = headers.get("authorization")?.strip_prefix("Bearer ")?;
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?
        .claims;
        Some(AuthIdentity {
            subject: claims.sub,
            roles: claims.roles,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuthConfig {
    #[serde(default = "default_true")]
    require_auth: bool,
    #[serde(default)]
    require_role: Vec<String>,
    #[serde(default)]
    allow_anonymous_paths: Vec<String>,
    #[serde(default)]
    path_roles: HashMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

pub struct AuthMiddleware {
    config: AuthConfig,
    adapter: Box<dyn AuthAdapter>,
}

impl AuthMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: AuthConfig =
            serde_json::from_value(value.clone()).map_err(|e| format!("auth middleware: {e}"))?;
        Ok(Self {
            config,
            adapter: Box::new(JwtAuthAdapter::from_env()),
        })
    }

    /// Lets a deployment provide its own [`AuthAdapter`] (OIDC, mTLS
    /// identity, ...) instead of the default JWT adapter.
    pub fn with_adapter(value: &serde_json::Value, adapter: Box<dyn AuthAdapter>) -> Result<Self, String> {
        let config: AuthConfig =
            serde_json::from_value(value.clone()).map_err(|e| format!("auth middleware: {e}"))?;
        Ok(Self { config, adapter })
    }

    fn is_anonymous_path(&self, path: &str) -> bool {
        self.config
            .allow_anonymous_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    fn required_roles_for(&self, path: &str) -> Vec<String> {
        for (pattern, roles) in &self.config.path_roles {
            if path.starts_with(pattern.as_str()) {
                return roles.clone();
            }
        }
        self.config.require_role.clone()
    }
}

impl Middleware for AuthMiddleware {
    fn pre_request(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        if !self.config.require_auth || self.is_anonymous_path(&parts.path) {
            return PreOutcome::Continue;
        }

        let identity = match self.adapter.authenticate(&parts.headers, &parts.cookies) {
            Some(identity) => identity,
            None => {
                emit_auth_attempt(ctx, "unauthenticated");
                return PreOutcome::Fail(MiddlewareError::Unauthenticated);
            }
        };

        let required = self.required_roles_for(&parts.path);
        if !required.is_empty() && !required.iter().any(|r| identity.roles.contains(r)) {
            emit_auth_attempt(ctx, "forbidden");
            return PreOutcome::Fail(MiddlewareError::Forbidden);
        }

        ctx.attachments
            .insert("auth.user".to_string(), serde_json::json!(identity.subject));
        ctx.attachments
            .insert("auth.roles".to_string(), serde_json::json!(identity.roles));
        emit_auth_attempt(ctx, "allowed");
        PreOutcome::Continue
    }
}

fn emit_auth_attempt(ctx: &MiddlewareContext, outcome: &str) {
    if let Some(obs) = &ctx.observability {
        obs.emit_auth_attempt(&AuthAttemptEvent {
            route_id: &ctx.route_id,
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDenies;
    impl AuthAdapter for AlwaysDenies {
        fn authenticate(&self, _: &HashMap<String, String>, _: &HashMap<String, String>) -> Option<AuthIdentity> {
            None
        }
    }

    struct AlwaysAllows;
    impl AuthAdapter for AlwaysAllows {
        fn authenticate(&self, _: &HashMap<String, String>, _: &HashMap<String, String>) -> Option<AuthIdentity> {
            Some(AuthIdentity {
                subject: "user-1".to_string(),
                roles: vec!["admin".to_string()],
            })
        }
    }

    #[test]
    fn missing_identity_is_unauthenticated() {
        let mw = AuthMiddleware::with_adapter(&serde_json::json!({}), Box::new(AlwaysDenies)).unwrap();
        let mut ctx = MiddlewareContext::default();
        let mut parts = RequestParts {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query_string: String::new(),
            query: ahash::AHashMap::default(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            client_ip: None,
            request_id: "r1".to_string(),
        };
        assert!(matches!(
            mw.pre_request(&mut ctx, &mut parts),
            PreOutcome::Fail(MiddlewareError::Unauthenticated)
        ));
    }

    #[test]
    fn swapped_adapter_attaches_identity() {
        let mw = AuthMiddleware::with_adapter(&serde_json::json!({}), Box::new(AlwaysAllows)).unwrap();
        let mut ctx = MiddlewareContext::default();
        let mut parts = RequestParts {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query_string: String::new(),
            query: ahash::AHashMap::default(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            client_ip: None,
            request_id: "r1".to_string(),
        };
        assert!(matches!(mw.pre_request(&mut ctx, &mut parts), PreOutcome::Continue));
        assert_eq!(ctx.attachments.get("auth.user").unwrap(), "user-1");
    }
}
