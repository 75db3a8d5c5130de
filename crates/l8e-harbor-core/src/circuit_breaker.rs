//! Circuit Breaker: one state machine per `(route_id, backend_url)` pair,
//! driven by real traffic only — health probes never feed it.

use crate::model::CircuitBreakerPolicy;
use crate::observability::{CircuitBreakerEvent, Observability};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

/// Whether the breaker admitted the call; `Denied` means the retry engine
/// should classify the attempt as a `gateway-error` without contacting the
/// backend.
pub enum Admission {
    Allowed,
    Denied,
}

/// Tumbling window failure-rate breaker. State transitions are serialized
/// per key via an internal mutex; counters for different keys never
/// contend with one another since each key owns its own `CircuitBreaker`.
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    state: AtomicU8,
    window_successes: AtomicU32,
    window_failures: AtomicU32,
    window_started_at_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    half_open_outstanding: AtomicU32,
    half_open_successes: AtomicU32,
    transition_lock: Mutex<()>,
    route_id: String,
    backend_url: String,
    observability: Option<Arc<Observability>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self::with_observability(policy, String::new(), String::new(), None)
    }

    /// Same as [`CircuitBreaker::new`] but attaches the `(route_id,
    /// backend_url)` labels and an [`Observability`] sink so state
    /// transitions publish `l8e_circuit_breaker_state` and a
    /// `CircuitBreakerEvent`.
    pub fn with_observability(
        policy: CircuitBreakerPolicy,
        route_id: String,
        backend_url: String,
        observability: Option<Arc<Observability>>,
    ) -> Self {
        Self {
            policy,
            state: AtomicU8::new(CircuitState::Closed as u8),
            window_successes: AtomicU32::new(0),
            window_failures: AtomicU32::new(0),
            window_started_at_ms: AtomicU64::new(now_ms()),
            opened_at_ms: AtomicU64::new(0),
            half_open_outstanding: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            transition_lock: Mutex::new(()),
            route_id,
            backend_url,
            observability,
        }
    }

    fn emit_transition(&self, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }
        if let Some(obs) = &self.observability {
            obs.emit_circuit_breaker(&CircuitBreakerEvent {
                route_id: &self.route_id,
                backend: &self.backend_url,
                from_state: from.as_str(),
                to_state: to.as_str(),
            });
            obs.metrics.set_gauge(
                "l8e_circuit_breaker_state",
                &format!("route=\"{}\",backend=\"{}\"", self.route_id, self.backend_url),
                to as i64,
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Called before dispatching an upstream attempt. Transitions OPEN ->
    /// HALF_OPEN once `open_timeout_ms` has elapsed, and bounds concurrent
    /// HALF_OPEN probes to `half_open_max_probes`.
    pub fn admit(&self) -> Admission {
        if !self.policy.enabled {
            return Admission::Allowed;
        }
        let _guard = self.transition_lock.lock().expect("circuit breaker poisoned");
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if now_ms().saturating_sub(opened_at) >= self.policy.open_timeout_ms {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
                    self.half_open_outstanding.store(1, Ordering::Release);
                    self.emit_transition(CircuitState::Open, CircuitState::HalfOpen);
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
            CircuitState::HalfOpen => {
                let outstanding = self.half_open_outstanding.load(Ordering::Acquire);
                if outstanding < self.policy.half_open_max_probes {
                    self.half_open_outstanding.fetch_add(1, Ordering::AcqRel);
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
        }
    }

    /// Records the outcome of an admitted call. `success` follows the
    /// classifier in §4.6: 4xx other than 408 count as success for breaker
    /// purposes even though they are not success for the client.
    pub fn record(&self, success: bool) {
        if !self.policy.enabled {
            return;
        }
        let _guard = self.transition_lock.lock().expect("circuit breaker poisoned");
        match self.state() {
            CircuitState::HalfOpen => {
                if success {
                    let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                    self.half_open_outstanding.fetch_sub(1, Ordering::AcqRel);
                    if successes >= self.policy.half_open_max_probes {
                        self.state.store(CircuitState::Closed as u8, Ordering::Release);
                        self.reset_window();
                        self.half_open_outstanding.store(0, Ordering::Release);
                        self.half_open_successes.store(0, Ordering::Release);
                        self.emit_transition(CircuitState::HalfOpen, CircuitState::Closed);
                    }
                } else {
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    self.opened_at_ms.store(now_ms(), Ordering::Release);
                    self.half_open_outstanding.store(0, Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Release);
                    self.emit_transition(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            CircuitState::Closed => {
                self.maybe_roll_window();
                if success {
                    self.window_successes.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.window_failures.fetch_add(1, Ordering::AcqRel);
                }
                let successes = self.window_successes.load(Ordering::Acquire);
                let failures = self.window_failures.load(Ordering::Acquire);
                let total = successes + failures;
                if total as u64 >= self.policy.minimum_requests as u64 {
                    let failure_pct = (failures as f64 / total as f64) * 100.0;
                    if failure_pct >= self.policy.failure_threshold_percent as f64 {
                        self.state.store(CircuitState::Open as u8, Ordering::Release);
                        self.opened_at_ms.store(now_ms(), Ordering::Release);
                        self.emit_transition(CircuitState::Closed, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {
                // A call that was already in flight when the breaker opened;
                // its outcome no longer affects the (fresh) window.
            }
        }
    }

    fn reset_window(&self) {
        self.window_successes.store(0, Ordering::Release);
        self.window_failures.store(0, Ordering::Release);
        self.window_started_at_ms.store(now_ms(), Ordering::Release);
    }

    fn maybe_roll_window(&self) {
        let started = self.window_started_at_ms.load(Ordering::Acquire);
        if now_ms().saturating_sub(started) >= self.policy.window_ms {
            self.reset_window();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CircuitBreakerPolicy;

    fn policy() -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            enabled: true,
            failure_threshold_percent: 50,
            minimum_requests: 10,
            window_ms: 1_000,
            open_timeout_ms: 500,
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn opens_after_threshold_breach() {
        let breaker = CircuitBreaker::new(policy());
        for _ in 0..10 {
            assert!(matches!(breaker.admit(), Admission::Allowed));
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.admit(), Admission::Denied));
    }

    #[test]
    fn stays_closed_below_minimum_requests() {
        let breaker = CircuitBreaker::new(policy());
        for _ in 0..5 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerPolicy {
            open_timeout_ms: 0,
            ..policy()
        });
        for _ in 0..10 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.admit(), Admission::Allowed));
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_success_closes() {
        let breaker = CircuitBreaker::new(CircuitBreakerPolicy {
            open_timeout_ms: 0,
            ..policy()
        });
        for _ in 0..10 {
            breaker.record(false);
        }
        assert!(matches!(breaker.admit(), Admission::Allowed));
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_stays_open_until_every_probe_succeeds() {
        let breaker = CircuitBreaker::new(CircuitBreakerPolicy {
            open_timeout_ms: 0,
            half_open_max_probes: 3,
            ..policy()
        });
        for _ in 0..10 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Denied));

        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_any_failure_reopens_even_with_other_successes_outstanding() {
        let breaker = CircuitBreaker::new(CircuitBreakerPolicy {
            open_timeout_ms: 0,
            half_open_max_probes: 3,
            ..policy()
        });
        for _ in 0..10 {
            breaker.record(false);
        }
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Allowed));

        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
