//! HTTP Forwarder: clones the incoming request minus hop-by-hop headers,
//! rewrites `Host`, applies path transforms, appends forwarding headers,
//! and streams both request and response bodies.

use crate::error::ProxyError;
use crate::model::{Backend, Route};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::web::Bytes;
use futures_util::StreamExt;
use log::debug;
use reqwest::{Client, Method as ReqwestMethod};
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Headers that must never be forwarded to the upstream, per §4.8.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub struct ForwardRequest {
    pub method: String,
    /// The request path as matched by the Router, prior to any
    /// strip_prefix/add_prefix transform.
    pub original_path: String,
    pub query_string: String,
    /// Lower-cased header names, already passed through the middleware
    /// pipeline's `pre_request` mutations.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub client_ip: Option<String>,
    pub request_id: String,
}

pub struct ForwardOutcome {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Forwarder {
    client: Client,
    /// Per-backend cap on concurrent in-flight upstream requests, keyed by
    /// backend URL and created lazily on first use.
    pool_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    pool_ceiling_per_backend: usize,
    pool_wait_ms: u64,
}

impl Forwarder {
    /// A single `reqwest::Client` gives per-authority connection pooling
    /// for free (reqwest keeps one pool per scheme+host+port internally);
    /// backends that disappear from every snapshot simply stop being
    /// addressed and their idle connections expire via `pool_idle_timeout`
    /// like any other idle connection.
    pub fn new() -> Self {
        Self::with_pool_limits(256, 1_000)
    }

    /// Same as [`Forwarder::new`] but sizes the reqwest idle-connection pool
    /// and the per-backend concurrency ceiling from the configured values
    /// instead of the built-in defaults.
    pub fn with_pool_limits(pool_ceiling_per_backend: usize, pool_wait_ms: u64) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(pool_ceiling_per_backend)
            .build()
            .expect("failed to build forwarder http client");
        Self {
            client,
            pool_semaphores: Mutex::new(HashMap::new()),
            pool_ceiling_per_backend,
            pool_wait_ms,
        }
    }

    /// Cheap clone (reqwest's client is internally `Arc`-backed) for the
    /// health prober, which needs its own `Client` handle per backend task.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn semaphore_for(&self, backend_url: &str) -> Arc<Semaphore> {
        let mut semaphores = self.pool_semaphores.lock().expect("forwarder pool registry poisoned");
        semaphores
            .entry(backend_url.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.pool_ceiling_per_backend)))
            .clone()
    }

    /// Performs exactly one upstream attempt against `backend`, with a
    /// per-attempt timeout covering time-to-first-byte. Does not retry;
    /// that is the Retry Engine's job.
    pub async fn forward(
        &self,
        route: &Route,
        backend: &Backend,
        req: &ForwardRequest,
    ) -> Result<ForwardOutcome, ProxyError> {
        let semaphore = self.semaphore_for(&backend.url);
        let _permit = match tokio::time::timeout(
            Duration::from_millis(self.pool_wait_ms),
            semaphore.acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(ProxyError::ConnectionError {
                    backend: backend.url.clone(),
                    message: "connection pool ceiling reached".to_string(),
                })
            }
        };

        let target_path = transform_path(route, &req.original_path);
        let target_url = build_target_url(backend, &target_path, &req.query_string);

        let method = parse_method(&req.method);
        let headers = build_upstream_headers(req, backend);

        debug!("forwarding {} {} -> {target_url}", req.method, req.original_path);

        let send_fut = self
            .client
            .request(method, &target_url)
            .headers(headers)
            .body(req.body.clone())
            .send();

        let response = tokio::time::timeout(Duration::from_millis(route.timeout_ms), send_fut)
            .await
            .map_err(|_| ProxyError::Timeout {
                timeout_ms: route.timeout_ms,
            })?
            .map_err(|e| classify_reqwest_error(&backend.url, e))?;

        let status = response.status().as_u16();
        let mut out_headers = HeaderMap::new();
        for (key, value) in response.headers() {
            if key.as_str().eq_ignore_ascii_case("connection") {
                continue;
            }
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(key.as_ref()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out_headers.insert(name, val);
            }
        }

        // Idle timeout between body chunks once streaming has begun;
        // defaults to the per-attempt timeout per §4.8.
        let idle_timeout = Duration::from_millis(route.timeout_ms);
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        loop {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => body.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => return Err(classify_reqwest_error(&backend.url, e)),
                Ok(None) => break,
                Err(_) => {
                    return Err(ProxyError::Timeout {
                        timeout_ms: route.timeout_ms,
                    })
                }
            }
        }

        Ok(ForwardOutcome {
            status,
            headers: out_headers,
            body: Bytes::from(body),
        })
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn transform_path(route: &Route, original_path: &str) -> String {
    let mut path = original_path.to_string();
    if route.strip_prefix {
        path = path
            .strip_prefix(route.path.as_str())
            .unwrap_or(&path)
            .to_string();
        if !path.starts_with('/') {
            path = format!("/{path}");
        }
    }
    if let Some(add_prefix) = &route.add_prefix {
        path = format!("{}{}", add_prefix.trim_end_matches('/'), path);
    }
    path
}

fn build_target_url(backend: &Backend, path: &str, query_string: &str) -> String {
    let base = backend.url.trim_end_matches('/');
    if query_string.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{query_string}")
    }
}

fn parse_method(method: &str) -> ReqwestMethod {
    ReqwestMethod::from_bytes(method.as_bytes()).unwrap_or(ReqwestMethod::GET)
}

fn build_upstream_headers(
    req: &ForwardRequest,
    backend: &Backend,
) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(req.headers.len() + 4);

    for (key, value) in &req.headers {
        if HOP_BY_HOP.iter().any(|h| key.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(val)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            out.insert(name, val);
        }
    }

    if let Some(ip) = &req.client_ip {
        let forwarded_for = match out.get("x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing.to_str().unwrap_or_default(), ip),
            None => ip.clone(),
        };
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&forwarded_for) {
            out.insert("x-forwarded-for", val);
        }
    }

    out.entry("x-forwarded-proto")
        .or_insert_with(|| reqwest::header::HeaderValue::from_static("http"));

    if !out.contains_key("x-forwarded-host") {
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&backend_authority(&backend.url)) {
            out.insert("x-forwarded-host", val);
        }
    }

    if !out.contains_key("x-request-id") {
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&req.request_id) {
            out.insert("x-request-id", val);
        }
    }

    out.entry(reqwest::header::USER_AGENT)
        .or_insert_with(|| reqwest::header::HeaderValue::from_static("l8e-harbor/0.1"));

    out
}

fn backend_authority(url: &str) -> String {
    url.split("://").nth(1).unwrap_or(url).to_string()
}

fn classify_reqwest_error(backend_url: &str, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout { timeout_ms: 0 }
    } else if is_connection_reset(&e) {
        ProxyError::ConnectionReset {
            backend: backend_url.to_string(),
        }
    } else if e.is_connect() {
        ProxyError::ConnectionError {
            backend: backend_url.to_string(),
            message: e.to_string(),
        }
    } else if e.is_status() {
        ProxyError::UpstreamStatus {
            status: e.status().map(|s| s.as_u16()).unwrap_or(502),
        }
    } else {
        ProxyError::ConnectionError {
            backend: backend_url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Walks the error's source chain looking for the underlying
/// `io::ErrorKind::ConnectionReset`/`ConnectionAborted`, which reqwest
/// doesn't surface as its own `is_*` predicate.
fn is_connection_reset(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = e.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Backend, CircuitBreakerPolicy, Matcher, RetryPolicy, Route};

    fn route(strip_prefix: bool, add_prefix: Option<&str>) -> Route {
        Route {
            id: "echo".to_string(),
            description: None,
            path: "/e".to_string(),
            methods: vec![],
            priority: 0,
            strip_prefix,
            add_prefix: add_prefix.map(|s| s.to_string()),
            timeout_ms: 5000,
            sticky_session: false,
            session_cookie: "sid".to_string(),
            matchers: Vec::<Matcher>::new(),
            backends: vec![],
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            middleware: vec![],
            created_at: None,
            updated_at: None,
            idempotent: false,
        }
    }

    #[test]
    fn strip_prefix_removes_route_path() {
        let r = route(true, None);
        assert_eq!(transform_path(&r, "/e/x"), "/x");
    }

    #[test]
    fn strip_prefix_then_add_prefix() {
        let r = route(true, Some("/v1"));
        assert_eq!(transform_path(&r, "/e/x"), "/v1/x");
    }

    #[test]
    fn no_strip_keeps_full_path() {
        let r = route(false, None);
        assert_eq!(transform_path(&r, "/e/x"), "/e/x");
    }

    #[tokio::test]
    async fn pool_ceiling_queues_then_times_out_past_the_bound() {
        let forwarder = Forwarder::with_pool_limits(1, 20);
        let semaphore = forwarder.semaphore_for("http://example.invalid");

        // Hold the only permit so a second acquire has to queue.
        let _held = semaphore.acquire_owned().await.unwrap();

        let second = semaphore.acquire_owned();
        let result = tokio::time::timeout(Duration::from_millis(forwarder.pool_wait_ms), second).await;
        assert!(result.is_err(), "second acquire should have queued past pool_wait_ms");
    }

    #[test]
    fn semaphore_for_is_shared_across_calls_for_the_same_backend() {
        let forwarder = Forwarder::with_pool_limits(4, 1_000);
        let a = forwarder.semaphore_for("http://backend-a");
        let b = forwarder.semaphore_for("http://backend-a");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
