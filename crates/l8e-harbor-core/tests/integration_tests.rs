//! End-to-end tests driving the full request-processing data plane: a real
//! bound mock upstream plus the gateway's own `GatewayContext`/`handlers`
//! wired the way the binary wires them, exercised through `actix_web::test`.

use actix_web::{test, web, App, HttpResponse};
use l8e_harbor_core::context::GatewayContext;
use l8e_harbor_core::handlers;
use l8e_harbor_core::model::{Backend, CircuitBreakerPolicy, MiddlewareEntry, RetryPolicy, Route};
use l8e_harbor_core::route_store::{InMemoryRouteStore, RouteStoreDriver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn base_route(id: &str, path: &str, backends: Vec<Backend>) -> Route {
    Route {
        id: id.to_string(),
        description: None,
        path: path.to_string(),
        methods: vec![],
        priority: 0,
        strip_prefix: false,
        add_prefix: None,
        timeout_ms: 2000,
        sticky_session: false,
        session_cookie: "sid".to_string(),
        matchers: vec![],
        backends,
        retry_policy: RetryPolicy::default(),
        circuit_breaker: CircuitBreakerPolicy::default(),
        middleware: vec![],
        created_at: None,
        updated_at: None,
        idempotent: false,
    }
}

fn backend(url: String) -> Backend {
    Backend {
        url,
        weight: 100,
        health_check: None,
        tls: None,
    }
}

fn ctx_from_routes(routes: Vec<Route>) -> Arc<GatewayContext> {
    let store: Arc<dyn RouteStoreDriver> = Arc::new(InMemoryRouteStore::new(routes).unwrap());
    GatewayContext::new(store).unwrap()
}

/// Binds a throwaway upstream on an OS-assigned port and returns its base URL
/// alongside the bound server's join handle, which the caller must abort
/// once the test no longer needs it.
async fn spawn_upstream<F, Fut>(factory: F) -> (String, tokio::task::JoinHandle<()>)
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = HttpResponse> + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = actix_web::HttpServer::new(move || {
        App::new().default_service(web::route().to(factory.clone()))
    })
    .listen(listener)
    .unwrap()
    .run();
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });
    (format!("http://127.0.0.1:{port}"), handle)
}

#[actix_web::test]
async fn basic_forward_reaches_upstream_and_returns_its_body() {
    let (upstream_url, _guard) =
        spawn_upstream(|| async { HttpResponse::Ok().body("hello from upstream") }).await;

    let route = base_route("echo", "/api", vec![backend(upstream_url)]);
    let ctx = ctx_from_routes(vec![route]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/widgets").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], b"hello from upstream");
}

#[actix_web::test]
async fn strip_prefix_forwards_the_trimmed_path() {
    let (upstream_url, _guard) = spawn_upstream(|| async { HttpResponse::Ok().body("stripped") }).await;

    let mut route = base_route("stripped", "/api", vec![backend(upstream_url)]);
    route.strip_prefix = true;
    let ctx = ctx_from_routes(vec![route]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/inner").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn retries_on_503_then_succeeds() {
    let attempts = web::Data::new(AtomicUsize::new(0));
    let attempts_for_upstream = attempts.clone();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = actix_web::HttpServer::new(move || {
        App::new().app_data(attempts_for_upstream.clone()).default_service(web::route().to(
            |counter: web::Data<AtomicUsize>| async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    HttpResponse::ServiceUnavailable().finish()
                } else {
                    HttpResponse::Ok().body("recovered")
                }
            },
        ))
    })
    .listen(listener)
    .unwrap()
    .run();
    let guard = tokio::spawn(async move {
        let _ = server.await;
    });

    let mut route = base_route("flaky", "/api", vec![backend(format!("http://127.0.0.1:{port}"))]);
    route.retry_policy = RetryPolicy {
        max_retries: 3,
        backoff_ms: 5,
        backoff_multiplier: 1.0,
        max_backoff_ms: 20,
        retry_on: ["5xx".to_string()].into_iter().collect(),
    };
    let ctx = ctx_from_routes(vec![route]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    guard.abort();
}

#[actix_web::test]
async fn circuit_opens_after_repeated_failures_and_denies_further_attempts() {
    let (upstream_url, _guard) = spawn_upstream(|| async { HttpResponse::InternalServerError().finish() }).await;

    let mut route = base_route("unstable", "/api", vec![backend(upstream_url)]);
    route.retry_policy = RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    };
    route.circuit_breaker = CircuitBreakerPolicy {
        enabled: true,
        failure_threshold_percent: 50,
        minimum_requests: 3,
        window_ms: 60_000,
        open_timeout_ms: 60_000,
        half_open_max_probes: 1,
    };
    let ctx = ctx_from_routes(vec![route]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    for _ in 0..3 {
        let req = test::TestRequest::get().uri("/api/x").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
    }

    // the breaker should now be open; the next call is denied before ever
    // reaching the (still-failing) upstream, and reports 503 accordingly.
    let req = test::TestRequest::get().uri("/api/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_web::test]
async fn sticky_session_pins_repeated_requests_to_one_backend() {
    let (upstream_a, guard_a) =
        spawn_upstream(|| async { HttpResponse::Ok().insert_header(("x-upstream-id", "a")).finish() }).await;
    let (upstream_b, guard_b) =
        spawn_upstream(|| async { HttpResponse::Ok().insert_header(("x-upstream-id", "b")).finish() }).await;

    let mut route = base_route("sticky", "/api", vec![backend(upstream_a), backend(upstream_b)]);
    route.sticky_session = true;
    route.session_cookie = "sid".to_string();
    let ctx = ctx_from_routes(vec![route]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/x")
        .insert_header(("cookie", "sid=some-session-value"))
        .to_request();
    let first = test::call_service(&app, req).await;
    let first_id = first.headers().get("x-upstream-id").unwrap().to_str().unwrap().to_string();

    for _ in 0..5 {
        let req = test::TestRequest::get()
            .uri("/api/x")
            .insert_header(("cookie", "sid=some-session-value"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let id = resp.headers().get("x-upstream-id").unwrap().to_str().unwrap();
        assert_eq!(id, first_id);
    }

    guard_a.abort();
    guard_b.abort();
}

#[actix_web::test]
async fn no_route_match_returns_404() {
    let ctx = ctx_from_routes(vec![]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/nowhere").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn unknown_middleware_name_is_rejected_at_route_store_apply_time() {
    let mut route = base_route("bad-mw", "/api", vec![backend("http://127.0.0.1:1".to_string())]);
    route.middleware = vec![MiddlewareEntry {
        name: "not-a-real-middleware".to_string(),
        config: serde_json::json!({}),
    }];
    let result = InMemoryRouteStore::new(vec![route]);
    assert!(result.is_err());
}

#[actix_web::test]
async fn exhausted_in_flight_semaphore_returns_503() {
    let (upstream_url, _guard) = spawn_upstream(|| async { HttpResponse::Ok().body("ok") }).await;
    let route = base_route("capped", "/api", vec![backend(upstream_url)]);
    let store: Arc<dyn RouteStoreDriver> = Arc::new(InMemoryRouteStore::new(vec![route]).unwrap());
    let ctx = GatewayContext::with_capacity(store, 1).unwrap();

    // Hold the only permit so the handler sees the cap as exhausted.
    let _held = ctx.in_flight.try_acquire().unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_web::test]
async fn health_and_readiness_endpoints_respond() {
    let store: Arc<dyn RouteStoreDriver> = Arc::new(InMemoryRouteStore::empty());
    let ctx = GatewayContext::new(store).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .route("/health", web::get().to(handlers::liveness))
            .route("/ready", web::get().to(handlers::readiness))
            .default_service(web::route().to(handlers::proxy)),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // no snapshot has ever been published through `apply`, so readiness
    // reports not-ready even though the process is alive.
    let req = test::TestRequest::get().uri("/ready").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}
