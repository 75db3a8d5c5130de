//! Retry Engine: wraps one logical request in the selector → circuit
//! breaker → forwarder loop, applying exponential backoff with jitter and
//! an idempotency guard between attempts.

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::ProxyError;
use crate::forwarder::{ForwardOutcome, ForwardRequest, Forwarder};
use crate::model::{BackendState, Route};
use crate::selector::{SelectionInput, Selector};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Looks up (creating lazily if needed) the circuit breaker owning a given
/// `(route_id, backend_url)` pair. Implemented by the gateway context; kept
/// as a trait here so the retry engine has no dependency on how breakers
/// are stored.
pub trait BreakerRegistry {
    fn breaker_for(&self, route_id: &str, backend_url: &str) -> Arc<CircuitBreaker>;
}

/// Per-backend runtime health, looked up the same way breakers are.
pub trait BackendStateRegistry {
    fn state_for(&self, backend_url: &str) -> Arc<BackendState>;
}

pub struct RetryEngine<'a> {
    forwarder: &'a Forwarder,
}

impl<'a> RetryEngine<'a> {
    pub fn new(forwarder: &'a Forwarder) -> Self {
        Self { forwarder }
    }

    /// Runs the attempt loop for `route`. `session_cookie_value` is the
    /// sticky-session cookie read from the inbound request, if any.
    /// `idempotency_ok` tells the engine whether this particular request is
    /// allowed to be retried at all for an otherwise-unsafe method.
    pub async fn execute(
        &self,
        route: &Route,
        breakers: &dyn BreakerRegistry,
        states: &dyn BackendStateRegistry,
        req_method: &str,
        session_cookie_value: Option<&str>,
        idempotency_ok: bool,
        mut build_request: impl FnMut() -> ForwardRequest,
    ) -> Result<ForwardOutcome, ProxyError> {
        let backend_states: Vec<Arc<BackendState>> = route
            .backends
            .iter()
            .map(|b| states.state_for(&b.url))
            .collect();

        let retryable = retry_allowed_for_method(req_method, idempotency_ok);
        let max_attempts = if retryable {
            route.retry_policy.max_retries + 1
        } else {
            1
        };

        let mut last_error: Option<ProxyError> = None;
        let mut excluded_url: Option<String> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = backoff_with_jitter(route.retry_policy.base_backoff_ms(attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let selection = SelectionInput {
                backends: &route.backends,
                states: &backend_states,
                sticky_session: route.sticky_session,
                session_cookie_value,
                exclude_url: excluded_url.as_deref(),
            };
            let backend = match Selector::select(&selection) {
                Ok(b) => b,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };

            let breaker = breakers.breaker_for(&route.id, &backend.url);
            if matches!(breaker.admit(), Admission::Denied) {
                last_error = Some(ProxyError::CircuitOpen {
                    route_id: route.id.clone(),
                    backend: backend.url.clone(),
                });
                if should_retry(route, last_error.as_ref().unwrap()) && attempt + 1 < max_attempts
                {
                    excluded_url = Some(backend.url.clone());
                    continue;
                }
                break;
            }

            let backend_idx = route.backends.iter().position(|b| b.url == backend.url);
            let backend_state = backend_idx.map(|i| &backend_states[i]);
            if let Some(state) = backend_state {
                state.enter_flight();
            }

            let fwd_req = build_request();
            let outcome = self.forwarder.forward(route, backend, &fwd_req).await;

            if let Some(state) = backend_state {
                state.leave_flight();
            }

            match outcome {
                Ok(resp) => {
                    breaker.record(!is_failure_status(resp.status));
                    if is_failure_status(resp.status) {
                        let err = ProxyError::UpstreamStatus { status: resp.status };
                        if should_retry(route, &err) && attempt + 1 < max_attempts {
                            last_error = Some(err);
                            excluded_url = Some(backend.url.clone());
                            continue;
                        }
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    breaker.record(!e.is_breaker_failure());
                    let retry_this = should_retry(route, &e) && attempt + 1 < max_attempts;
                    last_error = Some(e);
                    if retry_this {
                        excluded_url = Some(backend.url.clone());
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(ProxyError::NoHealthyBackend))
    }
}

/// GET/HEAD/OPTIONS/PUT/DELETE are always safe to retry. POST/PATCH need
/// either an `Idempotency-Key` header on the original request or
/// `route.idempotent`, both folded by the caller into `idempotency_ok`.
fn retry_allowed_for_method(method: &str, idempotency_ok: bool) -> bool {
    let is_unsafe = method.eq_ignore_ascii_case("POST") || method.eq_ignore_ascii_case("PATCH");
    !is_unsafe || idempotency_ok
}

fn is_failure_status(status: u16) -> bool {
    (500..600).contains(&status) || status == 408
}

fn should_retry(route: &Route, err: &ProxyError) -> bool {
    let retry_on = &route.retry_policy.retry_on;
    match err {
        ProxyError::UpstreamStatus { status } if (500..600).contains(status) => {
            retry_on.contains("5xx")
        }
        ProxyError::Timeout { .. } => retry_on.contains("timeout") || retry_on.contains("gateway-error"),
        ProxyError::ConnectionError { .. } | ProxyError::CircuitOpen { .. } => {
            retry_on.contains("connection_error") || retry_on.contains("gateway-error")
        }
        ProxyError::ConnectionReset { .. } => {
            retry_on.contains("reset") || retry_on.contains("gateway-error")
        }
        _ => false,
    }
}

/// `base * (1 +/- 10%)`, per the retry engine's jitter requirement.
fn backoff_with_jitter(base_ms: u64) -> u64 {
    let mut rng = rand::thread_rng();
    let jitter_pct = rng.gen_range(-0.10..=0.10);
    let jittered = base_ms as f64 * (1.0 + jitter_pct);
    jittered.max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetryPolicy;

    fn route_with_retry(max_retries: u32) -> Route {
        Route {
            id: "r".to_string(),
            description: None,
            path: "/r".to_string(),
            methods: vec![],
            priority: 0,
            strip_prefix: false,
            add_prefix: None,
            timeout_ms: 1000,
            sticky_session: false,
            session_cookie: "sid".to_string(),
            matchers: vec![],
            backends: vec![],
            retry_policy: RetryPolicy {
                max_retries,
                backoff_ms: 100,
                backoff_multiplier: 2.0,
                max_backoff_ms: 5000,
                retry_on: ["5xx".to_string(), "gateway-error".to_string()]
                    .into_iter()
                    .collect(),
            },
            circuit_breaker: Default::default(),
            middleware: vec![],
            created_at: None,
            updated_at: None,
            idempotent: false,
        }
    }

    #[test]
    fn retries_on_5xx_when_configured() {
        let route = route_with_retry(2);
        let err = ProxyError::UpstreamStatus { status: 503 };
        assert!(should_retry(&route, &err));
    }

    #[test]
    fn does_not_retry_4xx() {
        let route = route_with_retry(2);
        let err = ProxyError::UpstreamStatus { status: 404 };
        assert!(!should_retry(&route, &err));
    }

    #[test]
    fn retries_connection_error_with_underscore_literal() {
        let mut route = route_with_retry(2);
        route.retry_policy.retry_on = ["connection_error".to_string()].into_iter().collect();
        let err = ProxyError::ConnectionError {
            backend: "http://b".to_string(),
            message: "refused".to_string(),
        };
        assert!(should_retry(&route, &err));
    }

    #[test]
    fn retries_reset_when_configured() {
        let mut route = route_with_retry(2);
        route.retry_policy.retry_on = ["reset".to_string()].into_iter().collect();
        let err = ProxyError::ConnectionReset {
            backend: "http://b".to_string(),
        };
        assert!(should_retry(&route, &err));
    }

    #[test]
    fn does_not_retry_reset_when_not_configured() {
        let route = route_with_retry(2);
        let err = ProxyError::ConnectionReset {
            backend: "http://b".to_string(),
        };
        assert!(!should_retry(&route, &err));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5000,
            retry_on: Default::default(),
        };
        assert_eq!(policy.base_backoff_ms(0), 100);
        assert_eq!(policy.base_backoff_ms(1), 200);
        assert_eq!(policy.base_backoff_ms(2), 400);
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 500,
            retry_on: Default::default(),
        };
        assert_eq!(policy.base_backoff_ms(10), 500);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..200 {
            let j = backoff_with_jitter(1000);
            assert!((900..=1100).contains(&j), "jitter {j} out of bounds");
        }
    }
}
