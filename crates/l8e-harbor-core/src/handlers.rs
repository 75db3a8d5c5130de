//! Request handlers: the catch-all proxy route plus the three health
//! endpoints the core exposes (`/health`, `/ready`, `/health/detailed`).

use actix_web::http::header::HeaderMap;
use actix_web::web::{Bytes, Data};
use actix_web::{HttpRequest, HttpResponse};
use crate::context::{ContextRegistries, GatewayContext};
use crate::forwarder::ForwardRequest;
use crate::observability::ProxyRequestEvent;
use crate::pipeline::{MiddlewareContext, PreResult, RequestParts};
use crate::retry::RetryEngine;
use crate::router::MatchRequest;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

pub async fn readiness(ctx: Data<GatewayContext>) -> HttpResponse {
    let snapshot = ctx.route_store.current();
    if snapshot.version == 0 {
        return HttpResponse::ServiceUnavailable().body("no snapshot published yet");
    }
    HttpResponse::Ok().body("ready")
}

#[derive(Serialize)]
struct DetailedHealth {
    routes_total: u64,
    active_connections: i64,
    snapshot_version: u64,
}

pub async fn detailed_health(ctx: Data<GatewayContext>) -> HttpResponse {
    let snapshot = ctx.route_store.current();
    let body = DetailedHealth {
        routes_total: snapshot.routes.len() as u64,
        active_connections: ctx.observability.metrics.active_connections(),
        snapshot_version: snapshot.version,
    };
    HttpResponse::Ok().json(body)
}

/// The single catch-all handler: matches a Route, runs its middleware
/// pipeline, drives the retry engine, and runs `post_response`/`on_error`.
/// RAII guard keeping `l8e_proxy_active_connections` accurate across every
/// return path of [`proxy`], including early route-match/middleware exits.
struct ActiveConnectionGuard<'a>(&'a GatewayContext);

impl<'a> ActiveConnectionGuard<'a> {
    fn new(ctx: &'a GatewayContext) -> Self {
        ctx.observability.metrics.connection_opened();
        Self(ctx)
    }
}

impl Drop for ActiveConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.observability.metrics.connection_closed();
    }
}

pub async fn proxy(ctx: Data<GatewayContext>, req: HttpRequest, body: Bytes) -> HttpResponse {
    let request_id = extract_or_generate_request_id(req.headers());
    let _permit = match ctx.in_flight.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            return HttpResponse::ServiceUnavailable().json(crate::error::ErrorBody {
                error: "too many in-flight requests".to_string(),
                request_id,
            })
        }
    };

    let _conn_guard = ActiveConnectionGuard::new(&ctx);
    let started = Instant::now();
    let query = parse_query(req.query_string());

    let router = ctx.router();
    let match_req = MatchRequest {
        method: req.method().as_str(),
        path: req.path(),
        headers: req.headers(),
        query: &query,
    };

    let route_match = match router.find_match(&match_req) {
        Ok(m) => m,
        Err(e) => return e.to_response(&request_id),
    };
    let route = route_match.route;
    let pipeline = route_match.pipeline;

    let mut parts = RequestParts {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query_string: req.query_string().to_string(),
        query: query.clone(),
        headers: header_map_to_owned(req.headers()),
        cookies: parse_cookies(req.headers()),
        client_ip: req.peer_addr().map(|a| a.ip().to_string()),
        request_id: request_id.clone(),
    };

    let mut mw_ctx = MiddlewareContext {
        route_id: route.id.clone(),
        attachments: HashMap::new(),
        observability: Some(std::sync::Arc::clone(&ctx.observability)),
    };

    let pre = pipeline.run_pre(&mut mw_ctx, &mut parts);
    let (forward_result, ran_upto) = match pre {
        PreResult::AllContinued => {
            let ran_upto = pipeline.len().saturating_sub(1);
            let result = run_retry(&ctx, route, &parts, body).await;
            (result, ran_upto)
        }
        PreResult::ShortCircuited { response, ran_upto } => (Ok(response), ran_upto),
        PreResult::Failed { error, ran_upto } => {
            let proxy_err = crate::error::ProxyError::Middleware(error);
            if let Some(resp) = pipeline.run_on_error(&mut mw_ctx, &parts, &proxy_err, ran_upto) {
                (Ok(resp), ran_upto)
            } else {
                record_and_respond_error(&ctx, route, &parts, started, &proxy_err);
                return proxy_err.to_response(&request_id);
            }
        }
    };

    match forward_result {
        Ok(outcome) => {
            ctx.observability.emit_proxy_request(&ProxyRequestEvent {
                route_id: &route.id,
                backend: "selected",
                status: outcome.status,
                duration_ms: started.elapsed().as_millis() as u64,
                attempt: 0,
                request_id: &request_id,
            });
            let final_outcome = pipeline.run_post(&mut mw_ctx, &parts, outcome, ran_upto);
            build_http_response(final_outcome, &request_id)
        }
        Err(e) => {
            if let Some(resp) = pipeline.run_on_error(&mut mw_ctx, &parts, &e, ran_upto) {
                build_http_response(resp, &request_id)
            } else {
                record_and_respond_error(&ctx, route, &parts, started, &e);
                e.to_response(&request_id)
            }
        }
    }
}

fn record_and_respond_error(
    ctx: &GatewayContext,
    route: &crate::model::Route,
    parts: &RequestParts,
    started: Instant,
    e: &crate::error::ProxyError,
) {
    ctx.observability.emit_proxy_request(&ProxyRequestEvent {
        route_id: &route.id,
        backend: "none",
        status: e.status_code().as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
        attempt: 0,
        request_id: &parts.request_id,
    });
}

async fn run_retry(
    ctx: &GatewayContext,
    route: &crate::model::Route,
    parts: &RequestParts,
    body: Bytes,
) -> Result<crate::forwarder::ForwardOutcome, crate::error::ProxyError> {
    let registries = ContextRegistries {
        ctx,
        policy: &route.circuit_breaker,
    };
    let engine = RetryEngine::new(&ctx.forwarder);

    let session_cookie_value = parts.cookies.get(&route.session_cookie).map(|s| s.as_str());
    let idempotency_ok = route.idempotent || parts.headers.contains_key("idempotency-key");

    engine
        .execute(
            route,
            &registries,
            &registries,
            &parts.method,
            session_cookie_value,
            idempotency_ok,
            move || ForwardRequest {
                method: parts.method.clone(),
                original_path: parts.path.clone(),
                query_string: parts.query_string.clone(),
                headers: parts.headers.clone(),
                body: body.clone(),
                client_ip: parts.client_ip.clone(),
                request_id: parts.request_id.clone(),
            },
        )
        .await
}

fn build_http_response(
    outcome: crate::forwarder::ForwardOutcome,
    request_id: &str,
) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(outcome.status)
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in outcome.headers.iter() {
        builder.insert_header((name.clone(), value.clone()));
    }
    builder.insert_header(("x-request-id", request_id.to_string()));
    builder.body(outcome.body)
}

fn extract_or_generate_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn parse_query(query_string: &str) -> AHashMap<String, String> {
    let mut map = AHashMap::default();
    for pair in query_string.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        map.insert(key.to_string(), value.to_string());
    }
    map
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    if let Some(header_value) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        for pair in header_value.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                cookies.insert(k.to_string(), v.to_string());
            }
        }
    }
    cookies
}

fn header_map_to_owned(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }
    out
}
