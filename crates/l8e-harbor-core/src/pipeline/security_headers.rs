//! `security-headers` middleware: appends static security headers to every
//! response and strips configured response headers.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::forwarder::ForwardOutcome;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Default)]
struct SecurityHeadersConfig {
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    remove_headers: Vec<String>,
}

pub struct SecurityHeadersMiddleware {
    config: SecurityHeadersConfig,
}

impl SecurityHeadersMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: SecurityHeadersConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("security-headers middleware: {e}"))?;
        Ok(Self { config })
    }
}

impl Middleware for SecurityHeadersMiddleware {
    fn pre_request(&self, _ctx: &mut MiddlewareContext, _parts: &mut RequestParts) -> PreOutcome {
        PreOutcome::Continue
    }

    fn post_response(
        &self,
        _ctx: &mut MiddlewareContext,
        _parts: &RequestParts,
        mut resp: ForwardOutcome,
    ) -> ForwardOutcome {
        for name in &self.config.remove_headers {
            if let Ok(n) = actix_web::http::header::HeaderName::from_bytes(name.as_bytes()) {
                resp.headers.remove(n);
            }
        }
        for (name, value) in &self.config.headers {
            if let (Ok(n), Ok(v)) = (
                actix_web::http::header::HeaderName::from_bytes(name.as_bytes()),
                actix_web::http::header::HeaderValue::from_str(value),
            ) {
                resp.headers.insert(n, v);
            }
        }
        resp
    }
}
