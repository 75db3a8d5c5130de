//! Dependency-injected gateway context: holds the Route Store, the compiled
//! Router, the circuit-breaker and backend-state side tables, the shared
//! HTTP client, and the observability sinks. No global singletons; a test
//! constructs its own private `GatewayContext`.

use crate::circuit_breaker::CircuitBreaker;
use crate::forwarder::Forwarder;
use crate::health::Prober;
use crate::model::{BackendState, CircuitBreakerPolicy, Snapshot};
use crate::observability::Observability;
use crate::retry::{BackendStateRegistry, BreakerRegistry};
use crate::route_store::RouteStoreDriver;
use crate::router::Router;
use ahash::AHashMap;
use arc_swap::ArcSwap;
use log::{error, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Used by [`GatewayContext::new`] when no explicit in-flight cap is given;
/// callers that care about the configured value should use
/// [`GatewayContext::with_capacity`].
const DEFAULT_MAX_IN_FLIGHT_REQUESTS: usize = 10_000;

/// Key into the circuit-breaker registry: each `(route_id, backend_url)`
/// pair owns an independent breaker instance so unrelated keys never
/// contend on the same lock.
type BreakerKey = (String, String);

pub struct GatewayContext {
    pub route_store: Arc<dyn RouteStoreDriver>,
    pub forwarder: Forwarder,
    pub observability: Arc<Observability>,
    /// Bounds total concurrent in-flight requests per process, per §5;
    /// `handlers::proxy` acquires a permit before running a route's
    /// pipeline/retry and rejects with 503 when none is available.
    pub in_flight: Semaphore,

    router: ArcSwap<Router>,
    breakers: Mutex<AHashMap<BreakerKey, Arc<CircuitBreaker>>>,
    backend_states: Mutex<AHashMap<String, Arc<BackendState>>>,
    /// One prober per backend that declares a `health_check`, keyed by
    /// backend URL; dropping a `Prober` cancels its task.
    probers: Mutex<AHashMap<String, Prober>>,
}

impl GatewayContext {
    /// Compiles an initial `Router` from the store's current snapshot; the
    /// caller is expected to also spawn [`GatewayContext::run_snapshot_sync`]
    /// to keep the router current as the store publishes new snapshots.
    pub fn new(route_store: Arc<dyn RouteStoreDriver>) -> Result<Arc<Self>, String> {
        Self::with_capacity(route_store, DEFAULT_MAX_IN_FLIGHT_REQUESTS)
    }

    /// Same as [`GatewayContext::new`] but sizes the in-flight-request
    /// semaphore from a configured cap instead of the built-in default.
    pub fn with_capacity(
        route_store: Arc<dyn RouteStoreDriver>,
        max_in_flight_requests: usize,
    ) -> Result<Arc<Self>, String> {
        Self::with_resource_limits(route_store, max_in_flight_requests, 256, 1_000)
    }

    /// Full constructor: sizes both the in-flight-request semaphore and the
    /// forwarder's per-backend connection pool (ceiling plus bounded-wait
    /// timeout) from configured values instead of built-in defaults.
    pub fn with_resource_limits(
        route_store: Arc<dyn RouteStoreDriver>,
        max_in_flight_requests: usize,
        connection_pool_ceiling_per_backend: usize,
        connection_pool_wait_ms: u64,
    ) -> Result<Arc<Self>, String> {
        let snapshot = route_store.current();
        let router = Router::compile(&snapshot)?;
        let ctx = Arc::new(Self {
            route_store,
            forwarder: Forwarder::with_pool_limits(
                connection_pool_ceiling_per_backend,
                connection_pool_wait_ms,
            ),
            observability: Arc::new(Observability::new()),
            in_flight: Semaphore::new(max_in_flight_requests),
            router: ArcSwap::from_pointee(router),
            breakers: Mutex::new(AHashMap::default()),
            backend_states: Mutex::new(AHashMap::default()),
            probers: Mutex::new(AHashMap::default()),
        });
        ctx.sync_probers(&snapshot);
        Ok(ctx)
    }

    pub fn router(&self) -> arc_swap::Guard<Arc<Router>> {
        self.router.load()
    }

    /// Recompiles the router for every snapshot the store publishes,
    /// dropping circuit breakers and backend states for backends that no
    /// longer appear anywhere. Runs for the lifetime of the context; spawn
    /// it once at startup.
    pub async fn run_snapshot_sync(self: Arc<Self>) {
        let mut rx = self.route_store.watch();
        loop {
            match rx.recv().await {
                Ok(snapshot) => self.adopt_snapshot(&snapshot),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("route store watch lagged, skipped {skipped} snapshots; resyncing from current");
                    let current = self.route_store.current();
                    self.adopt_snapshot(&current);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("route store watch channel closed; router will no longer update");
                    return;
                }
            }
        }
    }

    fn adopt_snapshot(&self, snapshot: &Snapshot) {
        match Router::compile(snapshot) {
            Ok(router) => {
                self.router.store(Arc::new(router));
                self.prune_backend_state(snapshot);
                self.sync_probers(snapshot);
                self.observability
                    .metrics
                    .set_routes_total(snapshot.routes.len() as u64);
            }
            Err(e) => error!("snapshot v{} failed to compile, keeping previous router: {e}", snapshot.version),
        }
    }

    /// Spawns a [`Prober`] for every backend that declares a `health_check`
    /// and is missing one, and cancels (by dropping) probers for backends
    /// that no longer appear in any route.
    fn sync_probers(&self, snapshot: &Snapshot) {
        let mut wanted: AHashMap<String, crate::model::HealthCheckConfig> = AHashMap::default();
        for route in &snapshot.routes {
            for backend in &route.backends {
                if let Some(hc) = &backend.health_check {
                    wanted.entry(backend.url.clone()).or_insert_with(|| hc.clone());
                }
            }
        }

        let mut probers = self.probers.lock().expect("prober registry poisoned");
        probers.retain(|url, _| wanted.contains_key(url));
        for (url, hc) in wanted {
            if !probers.contains_key(&url) {
                let state = self.backend_state_for(&url);
                let prober = Prober::spawn(
                    self.forwarder.client(),
                    url.clone(),
                    hc,
                    state,
                    Arc::clone(&self.observability),
                );
                probers.insert(url, prober);
            }
        }
    }

    fn prune_backend_state(&self, snapshot: &Snapshot) {
        let live_urls: std::collections::HashSet<&str> = snapshot
            .routes
            .iter()
            .flat_map(|r| r.backends.iter().map(|b| b.url.as_str()))
            .collect();
        let live_keys: std::collections::HashSet<(&str, &str)> = snapshot
            .routes
            .iter()
            .flat_map(|r| r.backends.iter().map(move |b| (r.id.as_str(), b.url.as_str())))
            .collect();

        self.backend_states
            .lock()
            .expect("backend state registry poisoned")
            .retain(|url, _| live_urls.contains(url.as_str()));
        self.breakers
            .lock()
            .expect("breaker registry poisoned")
            .retain(|(route_id, url), _| live_keys.contains(&(route_id.as_str(), url.as_str())));
    }

    pub fn backend_state_for(&self, backend_url: &str) -> Arc<BackendState> {
        let mut states = self.backend_states.lock().expect("backend state registry poisoned");
        states
            .entry(backend_url.to_string())
            .or_insert_with(|| Arc::new(BackendState::default()))
            .clone()
    }

    pub fn breaker_for_key(&self, route_id: &str, backend_url: &str, policy: &CircuitBreakerPolicy) -> Arc<CircuitBreaker> {
        let key = (route_id.to_string(), backend_url.to_string());
        let observability = Arc::clone(&self.observability);
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_observability(
                    policy.clone(),
                    route_id.to_string(),
                    backend_url.to_string(),
                    Some(observability),
                ))
            })
            .clone()
    }
}

/// Adapts [`GatewayContext`] to the Retry Engine's registry traits. The
/// policy used to construct a breaker on first lookup comes from whichever
/// route first asks for that `(route_id, backend_url)` pair; since breaker
/// policy is route-scoped and the key already includes `route_id`, the same
/// route always supplies the same policy.
pub struct ContextRegistries<'a> {
    pub ctx: &'a GatewayContext,
    pub policy: &'a CircuitBreakerPolicy,
}

impl<'a> BreakerRegistry for ContextRegistries<'a> {
    fn breaker_for(&self, route_id: &str, backend_url: &str) -> Arc<CircuitBreaker> {
        self.ctx.breaker_for_key(route_id, backend_url, self.policy)
    }
}

impl<'a> BackendStateRegistry for ContextRegistries<'a> {
    fn state_for(&self, backend_url: &str) -> Arc<BackendState> {
        self.ctx.backend_state_for(backend_url)
    }
}
