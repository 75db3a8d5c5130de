//! Observability: a structured JSON event emitter on its own log target
//! (distinct from human-readable request logs) plus an in-process metrics
//! registry exposing the stable counter/gauge/histogram names. Not a
//! Prometheus scrape endpoint — that's an external collaborator's job.

use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Target used for every structured event, so a log pipeline can route
/// `target=l8e_harbor_core::events` separately from human-facing logs.
pub const EVENTS_TARGET: &str = "l8e_harbor_core::events";

#[derive(Serialize)]
pub struct ProxyRequestEvent<'a> {
    pub route_id: &'a str,
    pub backend: &'a str,
    pub status: u16,
    pub duration_ms: u64,
    pub attempt: u32,
    pub request_id: &'a str,
}

#[derive(Serialize)]
pub struct CircuitBreakerEvent<'a> {
    pub route_id: &'a str,
    pub backend: &'a str,
    pub from_state: &'a str,
    pub to_state: &'a str,
}

#[derive(Serialize)]
pub struct AuthAttemptEvent<'a> {
    pub route_id: &'a str,
    pub outcome: &'a str,
}

#[derive(Serialize)]
pub struct RateLimitEvent<'a> {
    pub route_id: &'a str,
    pub key: &'a str,
    pub outcome: &'a str,
}

/// Counters, gauges, and a coarse histogram bucket set. A single mutex is
/// enough here: this registry is hit once per request, not once per byte,
/// and keeps the implementation honest rather than introducing sharded
/// counters before the API is worth optimizing.
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    active_connections: AtomicI64,
    routes_total: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            routes_total: AtomicU64::new(0),
        }
    }
}

impl MetricsRegistry {
    pub fn incr(&self, name: &str, labels_suffix: &str) {
        let key = format!("{name}{{{labels_suffix}}}");
        *self.counters.lock().expect("metrics poisoned").entry(key).or_insert(0) += 1;
    }

    pub fn observe(&self, name: &str, labels_suffix: &str, value: f64) {
        let key = format!("{name}{{{labels_suffix}}}");
        self.histograms
            .lock()
            .expect("metrics poisoned")
            .entry(key)
            .or_default()
            .push(value);
    }

    pub fn set_gauge(&self, name: &str, labels_suffix: &str, value: i64) {
        let key = format!("{name}{{{labels_suffix}}}");
        self.gauges.lock().expect("metrics poisoned").insert(key, value);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn set_routes_total(&self, count: u64) {
        self.routes_total.store(count, Ordering::Relaxed);
    }

    pub fn routes_total(&self) -> u64 {
        self.routes_total.load(Ordering::Relaxed)
    }

    /// Snapshot for a human-readable `/health/detailed` response; not a
    /// Prometheus text-format exporter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().expect("metrics poisoned").clone(),
            gauges: self.gauges.lock().expect("metrics poisoned").clone(),
            active_connections: self.active_connections(),
            routes_total: self.routes_total(),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, i64>,
    pub active_connections: i64,
    pub routes_total: u64,
}

pub struct Observability {
    pub metrics: MetricsRegistry,
}

impl Observability {
    pub fn new() -> Self {
        Self {
            metrics: MetricsRegistry::default(),
        }
    }

    pub fn emit_proxy_request(&self, event: &ProxyRequestEvent) {
        self.metrics.incr(
            "l8e_proxy_requests_total",
            &format!("route=\"{}\",status=\"{}\"", event.route_id, event.status),
        );
        self.metrics.observe(
            "l8e_proxy_request_duration_seconds",
            &format!("route=\"{}\"", event.route_id),
            event.duration_ms as f64 / 1000.0,
        );
        log_event(event);
    }

    pub fn emit_circuit_breaker(&self, event: &CircuitBreakerEvent) {
        self.metrics.incr(
            "l8e_circuit_breaker_events_total",
            &format!("route=\"{}\",backend=\"{}\"", event.route_id, event.backend),
        );
        log_event(event);
    }

    pub fn emit_auth_attempt(&self, event: &AuthAttemptEvent) {
        self.metrics.incr(
            "l8e_auth_attempts_total",
            &format!("route=\"{}\",outcome=\"{}\"", event.route_id, event.outcome),
        );
        log_event(event);
    }

    pub fn emit_rate_limit(&self, event: &RateLimitEvent) {
        self.metrics.incr(
            "l8e_rate_limit_events_total",
            &format!("route=\"{}\",outcome=\"{}\"", event.route_id, event.outcome),
        );
        log_event(event);
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: EVENTS_TARGET, "{json}"),
        Err(e) => info!(target: EVENTS_TARGET, "event serialization failed: {e}"),
    }
}
