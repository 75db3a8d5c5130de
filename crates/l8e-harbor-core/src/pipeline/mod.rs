//! Middleware Pipeline: an ordered chain of named, per-route interceptors
//! with `{pre_request, post_response, on_error}` capabilities, built once
//! per compiled route from its `middleware` entries.

mod auth;
mod cors;
mod header_rewrite;
mod logging;
mod rate_limit;
mod security_headers;
mod tracing_mw;

use crate::error::{MiddlewareError, ProxyError};
use crate::forwarder::ForwardOutcome;
use crate::model::MiddlewareEntry;
use crate::observability::Observability;
use ahash::AHashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// The request facts visible to, and mutable by, middleware. Built from the
/// inbound actix request before the pipeline runs, and handed to the
/// forwarder afterward.
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub query: AHashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub client_ip: Option<String>,
    pub request_id: String,
}

/// Per-request scratch space middleware use to pass facts to one another
/// (e.g. auth attaching the resolved user id for rate-limit's `key_by:
/// user` mode) and to later stages of the pipeline.
#[derive(Default)]
pub struct MiddlewareContext {
    pub route_id: String,
    pub attachments: HashMap<String, serde_json::Value>,
    pub observability: Option<Arc<Observability>>,
}

pub enum PreOutcome {
    Continue,
    ShortCircuit(ForwardOutcome),
    Fail(MiddlewareError),
}

pub trait Middleware: Send + Sync {
    fn pre_request(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome;

    fn post_response(
        &self,
        _ctx: &mut MiddlewareContext,
        _parts: &RequestParts,
        resp: ForwardOutcome,
    ) -> ForwardOutcome {
        resp
    }

    /// Returning `Some` suppresses the error and substitutes this response.
    fn on_error(
        &self,
        _ctx: &mut MiddlewareContext,
        _parts: &RequestParts,
        _err: &ProxyError,
    ) -> Option<ForwardOutcome> {
        None
    }
}

pub enum PreResult {
    AllContinued,
    ShortCircuited { response: ForwardOutcome, ran_upto: usize },
    Failed { error: MiddlewareError, ran_upto: usize },
}

pub struct Pipeline {
    middlewares: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    /// Builds a pipeline from a route's declared middleware entries.
    /// Unknown names are rejected here, which the Route Store surfaces as
    /// an `apply`-time validation error.
    pub fn build(entries: &[MiddlewareEntry]) -> Result<Self, String> {
        let mut middlewares = Vec::with_capacity(entries.len());
        for entry in entries {
            middlewares.push(build_one(&entry.name, &entry.config)?);
        }
        Ok(Self { middlewares })
    }

    pub fn empty() -> Self {
        Self { middlewares: Vec::new() }
    }

    /// Runs `pre_request` in declaration order, stopping at the first
    /// short-circuit or failure.
    pub fn run_pre(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreResult {
        for (idx, mw) in self.middlewares.iter().enumerate() {
            match mw.pre_request(ctx, parts) {
                PreOutcome::Continue => continue,
                PreOutcome::ShortCircuit(response) => {
                    return PreResult::ShortCircuited { response, ran_upto: idx }
                }
                PreOutcome::Fail(error) => return PreResult::Failed { error, ran_upto: idx },
            }
        }
        PreResult::AllContinued
    }

    /// Runs `post_response` in reverse order over middlewares `0..=ran_upto`
    /// whose `pre_request` returned `Continue` (i.e. every one strictly
    /// before the index that short-circuited or failed, plus that index
    /// itself when it ran to completion).
    pub fn run_post(
        &self,
        ctx: &mut MiddlewareContext,
        parts: &RequestParts,
        mut resp: ForwardOutcome,
        ran_upto: usize,
    ) -> ForwardOutcome {
        if self.middlewares.is_empty() {
            return resp;
        }
        for mw in self.middlewares[..=ran_upto.min(self.middlewares.len() - 1)]
            .iter()
            .rev()
        {
            resp = mw.post_response(ctx, parts, resp);
        }
        resp
    }

    pub fn run_on_error(
        &self,
        ctx: &mut MiddlewareContext,
        parts: &RequestParts,
        err: &ProxyError,
        ran_upto: usize,
    ) -> Option<ForwardOutcome> {
        if self.middlewares.is_empty() {
            return None;
        }
        for mw in self.middlewares[..=ran_upto.min(self.middlewares.len() - 1)]
            .iter()
            .rev()
        {
            if let Some(resp) = mw.on_error(ctx, parts, err) {
                return Some(resp);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

fn build_one(name: &str, config: &serde_json::Value) -> Result<Box<dyn Middleware>, String> {
    match name {
        "auth" => Ok(Box::new(auth::AuthMiddleware::from_config(config)?)),
        "cors" => Ok(Box::new(cors::CorsMiddleware::from_config(config)?)),
        "header-rewrite" => Ok(Box::new(header_rewrite::HeaderRewriteMiddleware::from_config(
            config,
        )?)),
        "rate-limit" => Ok(Box::new(rate_limit::RateLimitMiddleware::from_config(config)?)),
        "logging" => Ok(Box::new(logging::LoggingMiddleware::from_config(config)?)),
        "tracing" => Ok(Box::new(tracing_mw::TracingMiddleware::from_config(config)?)),
        "security-headers" => Ok(Box::new(
            security_headers::SecurityHeadersMiddleware::from_config(config)?,
        )),
        other => Err(format!("unknown middleware '{other}'")),
    }
}

/// Rejects a route's middleware entries at `apply` time if any name is
/// unknown or its config fails to parse, without keeping the built chain
/// around (the Router rebuilds and owns the real `Pipeline` per snapshot).
pub fn validate_entries(entries: &[MiddlewareEntry]) -> Result<(), String> {
    Pipeline::build(entries).map(|_| ())
}

pub use auth::AuthMiddleware;
pub use cors::CorsMiddleware;
pub use header_rewrite::HeaderRewriteMiddleware;
pub use logging::LoggingMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use security_headers::SecurityHeadersMiddleware;
pub use tracing_mw::TracingMiddleware;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parts() -> RequestParts {
        RequestParts {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query_string: String::new(),
            query: AHashMap::default(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            client_ip: None,
            request_id: "r1".to_string(),
        }
    }

    fn outcome() -> ForwardOutcome {
        ForwardOutcome {
            status: 200,
            headers: actix_web::http::header::HeaderMap::new(),
            body: actix_web::web::Bytes::new(),
        }
    }

    #[test]
    fn unknown_middleware_name_rejected() {
        let entries = vec![MiddlewareEntry {
            name: "not-a-real-middleware".to_string(),
            config: serde_json::json!({}),
        }];
        assert!(Pipeline::build(&entries).is_err());
    }

    #[test]
    fn empty_pipeline_run_post_is_identity() {
        let pipeline = Pipeline::empty();
        let mut ctx = MiddlewareContext::default();
        let parts = sample_parts();
        let resp = pipeline.run_post(&mut ctx, &parts, outcome(), 0);
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn empty_pipeline_run_on_error_returns_none() {
        let pipeline = Pipeline::empty();
        let mut ctx = MiddlewareContext::default();
        let parts = sample_parts();
        let err = ProxyError::NoHealthyBackend;
        assert!(pipeline.run_on_error(&mut ctx, &parts, &err, 0).is_none());
    }

    #[test]
    fn empty_pipeline_run_pre_all_continued() {
        let pipeline = Pipeline::empty();
        let mut ctx = MiddlewareContext::default();
        let mut parts = sample_parts();
        assert!(matches!(pipeline.run_pre(&mut ctx, &mut parts), PreResult::AllContinued));
    }

    #[test]
    fn security_headers_middleware_builds_from_config() {
        let entries = vec![MiddlewareEntry {
            name: "security-headers".to_string(),
            config: serde_json::json!({"headers": {"x-frame-options": "DENY"}}),
        }];
        let pipeline = Pipeline::build(&entries).unwrap();
        assert_eq!(pipeline.len(), 1);
    }
}
