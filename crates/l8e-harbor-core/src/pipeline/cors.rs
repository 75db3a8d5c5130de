//! `cors` middleware: reflects or restricts cross-origin requests and
//! short-circuits preflight `OPTIONS` requests.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::forwarder::ForwardOutcome;
use actix_web::http::header::HeaderMap;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
struct CorsConfig {
    #[serde(default)]
    allow_origins: Vec<String>,
    #[serde(default)]
    allow_methods: Vec<String>,
    #[serde(default)]
    allow_headers: Vec<String>,
    #[serde(default)]
    expose_headers: Vec<String>,
    #[serde(default)]
    allow_credentials: bool,
    #[serde(default)]
    max_age: Option<u64>,
}

pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: CorsConfig =
            serde_json::from_value(value.clone()).map_err(|e| format!("cors middleware: {e}"))?;
        Ok(Self { config })
    }

    fn resolved_origin(&self, origin: Option<&str>) -> Option<String> {
        let origin = origin?;
        if self.config.allow_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        if self.config.allow_origins.iter().any(|o| o == origin) {
            return Some(origin.to_string());
        }
        None
    }

    fn apply_headers(&self, headers: &mut HeaderMap, origin: Option<&str>) {
        if let Some(allowed) = self.resolved_origin(origin) {
            insert(headers, "access-control-allow-origin", &allowed);
            if self.config.allow_credentials {
                insert(headers, "access-control-allow-credentials", "true");
            }
            if !self.config.expose_headers.is_empty() {
                insert(
                    headers,
                    "access-control-expose-headers",
                    &self.config.expose_headers.join(", "),
                );
            }
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(n), Ok(v)) = (
        actix_web::http::header::HeaderName::from_bytes(name.as_bytes()),
        actix_web::http::header::HeaderValue::from_str(value),
    ) {
        headers.insert(n, v);
    }
}

impl Middleware for CorsMiddleware {
    fn pre_request(&self, _ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        let origin = parts.headers.get("origin").cloned();

        if parts.method.eq_ignore_ascii_case("OPTIONS") {
            let mut headers = HeaderMap::new();
            self.apply_headers(&mut headers, origin.as_deref());
            if !self.config.allow_methods.is_empty() {
                insert(
                    &mut headers,
                    "access-control-allow-methods",
                    &self.config.allow_methods.join(", "),
                );
            }
            if !self.config.allow_headers.is_empty() {
                insert(
                    &mut headers,
                    "access-control-allow-headers",
                    &self.config.allow_headers.join(", "),
                );
            }
            if let Some(max_age) = self.config.max_age {
                insert(&mut headers, "access-control-max-age", &max_age.to_string());
            }
            return PreOutcome::ShortCircuit(ForwardOutcome {
                status: 204,
                headers,
                body: actix_web::web::Bytes::new(),
            });
        }

        PreOutcome::Continue
    }

    fn post_response(
        &self,
        _ctx: &mut MiddlewareContext,
        parts: &RequestParts,
        mut resp: ForwardOutcome,
    ) -> ForwardOutcome {
        let origin = parts.headers.get("origin").map(|s| s.as_str());
        self.apply_headers(&mut resp.headers, origin);
        resp
    }
}
