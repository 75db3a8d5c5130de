//! Router (Matcher): picks the highest-priority Route matching an incoming
//! request. A longer path prefix does not implicitly win — only `priority`
//! and, on ties, lexicographically smallest `id` decide.

use crate::error::ProxyError;
use crate::model::{anchored_pattern, Matcher, MatcherOp, MatcherSource, Route, Snapshot};
use crate::pipeline::Pipeline;
use ahash::AHashMap;
use regex::Regex;
use std::sync::Arc;

/// Request facts the router and matchers need; decoupled from any specific
/// web framework's request type so it can be constructed from actix-web,
/// or from a test harness, alike.
pub struct MatchRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a actix_web::http::header::HeaderMap,
    pub query: &'a AHashMap<String, String>,
}

/// A route plus its matcher patterns pre-compiled once per snapshot, so
/// regex compilation never happens on the request hot path.
struct CompiledRoute {
    route: Route,
    compiled_matchers: Vec<CompiledMatcher>,
    pipeline: Pipeline,
}

/// A successful match: the route plus its pre-built middleware chain, so
/// the caller never rebuilds a `Pipeline` on the request hot path.
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub pipeline: &'a Pipeline,
}

struct CompiledMatcher {
    source: MatcherSource,
    key: String,
    op: MatcherOp,
    value: String,
    regex: Option<Arc<Regex>>,
}

/// Indexes a [`Snapshot`] by path prefix for fast candidate lookup while
/// preserving the global priority/id tie-break rule across buckets a
/// request's path could fall into.
pub struct Router {
    snapshot_version: u64,
    routes: Vec<CompiledRoute>,
    /// Maps the first path segment to indices into `routes`, so a request
    /// only scans routes that could plausibly match instead of every route
    /// in the snapshot. Routes whose path is just `/` go in `catch_all`.
    by_first_segment: AHashMap<String, Vec<usize>>,
    catch_all: Vec<usize>,
}

impl Router {
    /// Compiles every route's matchers once; a route with an invalid regex
    /// matcher is rejected at `apply` time (before it ever reaches here), so
    /// this only needs to re-validate defensively.
    pub fn compile(snapshot: &Snapshot) -> Result<Self, String> {
        let mut routes = Vec::with_capacity(snapshot.routes.len());
        let mut by_first_segment: AHashMap<String, Vec<usize>> = AHashMap::default();
        let mut catch_all = Vec::new();

        for route in &snapshot.routes {
            let mut compiled_matchers = Vec::with_capacity(route.matchers.len());
            for m in &route.matchers {
                let regex = if m.op == MatcherOp::Regex {
                    Some(Arc::new(
                        Regex::new(&anchored_pattern(&m.value))
                            .map_err(|e| format!("route {}: invalid matcher regex: {e}", route.id))?,
                    ))
                } else {
                    None
                };
                compiled_matchers.push(CompiledMatcher {
                    source: m.source,
                    key: m.key.clone(),
                    op: m.op,
                    value: m.value.clone(),
                    regex,
                });
            }
            let idx = routes.len();
            let segment = first_segment(&route.path);
            if segment.is_empty() {
                catch_all.push(idx);
            } else {
                by_first_segment.entry(segment).or_default().push(idx);
            }
            let pipeline = Pipeline::build(&route.middleware)
                .map_err(|e| format!("route {}: {e}", route.id))?;
            routes.push(CompiledRoute {
                route: route.clone(),
                compiled_matchers,
                pipeline,
            });
        }

        Ok(Self {
            snapshot_version: snapshot.version,
            routes,
            by_first_segment,
            catch_all,
        })
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Among routes whose path is a prefix of the request path AND whose
    /// method set permits the request method AND whose matchers all hold,
    /// picks the one with lowest `priority`; ties break on lexicographically
    /// smallest `id`.
    pub fn find_match(&self, req: &MatchRequest) -> Result<RouteMatch<'_>, ProxyError> {
        let segment = first_segment(req.path);
        let mut best: Option<&CompiledRoute> = None;

        let candidate_indices = self
            .by_first_segment
            .get(&segment)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter());

        for &idx in candidate_indices {
            let candidate = &self.routes[idx];
            if !req.path.starts_with(candidate.route.path.as_str()) {
                continue;
            }
            if !candidate.route.methods_allow(req.method) {
                continue;
            }
            if !matchers_hold(&candidate.compiled_matchers, req) {
                continue;
            }
            best = Some(match best {
                None => candidate,
                Some(current) => pick_better(current, candidate),
            });
        }

        best.map(|c| RouteMatch {
            route: &c.route,
            pipeline: &c.pipeline,
        })
        .ok_or_else(|| ProxyError::NoRouteMatched {
            path: req.path.to_string(),
        })
    }
}

fn pick_better<'a>(a: &'a CompiledRoute, b: &'a CompiledRoute) -> &'a CompiledRoute {
    match a.route.priority.cmp(&b.route.priority) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            if a.route.id <= b.route.id {
                a
            } else {
                b
            }
        }
    }
}

fn first_segment(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(pos) => trimmed[..pos].to_string(),
        None => trimmed.to_string(),
    }
}

fn matchers_hold(matchers: &[CompiledMatcher], req: &MatchRequest) -> bool {
    matchers.iter().all(|m| matcher_holds(m, req))
}

fn matcher_holds(m: &CompiledMatcher, req: &MatchRequest) -> bool {
    let found = match m.source {
        MatcherSource::Header => req
            .headers
            .get(m.key.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        MatcherSource::Query => req.query.get(&m.key).cloned(),
    };

    match m.op {
        MatcherOp::Exists => found.is_some(),
        MatcherOp::Equals => found.as_deref() == Some(m.value.as_str()),
        MatcherOp::Contains => found.as_deref().is_some_and(|v| v.contains(&m.value)),
        MatcherOp::Prefix => found.as_deref().is_some_and(|v| v.starts_with(&m.value)),
        MatcherOp::Suffix => found.as_deref().is_some_and(|v| v.ends_with(&m.value)),
        MatcherOp::Regex => match (&found, &m.regex) {
            (Some(v), Some(re)) => re.is_match(v),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Backend, Route};

    fn route(id: &str, path: &str, priority: i64) -> Route {
        Route {
            id: id.to_string(),
            description: None,
            path: path.to_string(),
            methods: vec![],
            priority,
            strip_prefix: false,
            add_prefix: None,
            timeout_ms: 5000,
            sticky_session: false,
            session_cookie: "sid".to_string(),
            matchers: vec![],
            backends: vec![Backend {
                url: "http://backend".to_string(),
                weight: 100,
                health_check: None,
                tls: None,
            }],
            retry_policy: Default::default(),
            circuit_breaker: Default::default(),
            middleware: vec![],
            created_at: None,
            updated_at: None,
            idempotent: false,
        }
    }

    fn empty_headers() -> actix_web::http::header::HeaderMap {
        actix_web::http::header::HeaderMap::new()
    }

    #[test]
    fn lowest_priority_wins() {
        let snapshot = Snapshot::new(
            1,
            vec![route("low-prio", "/a", 20), route("high-prio", "/a", 10)],
        );
        let router = Router::compile(&snapshot).unwrap();
        let headers = empty_headers();
        let query = AHashMap::default();
        let req = MatchRequest {
            method: "GET",
            path: "/a/x",
            headers: &headers,
            query: &query,
        };
        assert_eq!(router.find_match(&req).unwrap().route.id, "high-prio");
    }

    #[test]
    fn tie_break_on_lowest_id() {
        let snapshot = Snapshot::new(1, vec![route("route-b", "/a", 10), route("route-a", "/a", 10)]);
        let router = Router::compile(&snapshot).unwrap();
        let headers = empty_headers();
        let query = AHashMap::default();
        let req = MatchRequest {
            method: "GET",
            path: "/a/x",
            headers: &headers,
            query: &query,
        };
        assert_eq!(router.find_match(&req).unwrap().route.id, "route-a");
    }

    #[test]
    fn no_match_returns_error() {
        let snapshot = Snapshot::new(1, vec![route("only", "/a", 10)]);
        let router = Router::compile(&snapshot).unwrap();
        let headers = empty_headers();
        let query = AHashMap::default();
        let req = MatchRequest {
            method: "GET",
            path: "/b",
            headers: &headers,
            query: &query,
        };
        assert!(matches!(
            router.find_match(&req),
            Err(ProxyError::NoRouteMatched { .. })
        ));
    }
}
