//! Backend Selector: weighted random among healthy backends, with optional
//! sticky sessions. Backend runtime state lives in a side table keyed by
//! backend URL (see [`crate::model::BackendState`]), never on the route.

use crate::error::ProxyError;
use crate::model::{Backend, BackendState};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Read-only view over a route's backends plus their runtime health,
/// looked up by the caller from the shared backend-state side table before
/// invoking the selector.
pub struct SelectionInput<'a> {
    pub backends: &'a [Backend],
    pub states: &'a [Arc<BackendState>],
    pub sticky_session: bool,
    pub session_cookie_value: Option<&'a str>,
    pub exclude_url: Option<&'a str>,
}

pub struct Selector;

impl Selector {
    /// Implements the selection algorithm in §4.4: filter to non-DOWN
    /// backends (UNKNOWN counts as healthy to avoid a cold-start
    /// blackout), prefer a sticky hash match when configured, otherwise
    /// weighted random; exclude a previously tried backend when an
    /// alternative exists.
    pub fn select<'a>(input: &SelectionInput<'a>) -> Result<&'a Backend, ProxyError> {
        let eligible: Vec<usize> = (0..input.backends.len())
            .filter(|&i| input.states[i].is_eligible())
            .filter(|&i| {
                input
                    .exclude_url
                    .map(|excluded| input.backends[i].url != excluded)
                    .unwrap_or(true)
            })
            .collect();

        let eligible = if eligible.is_empty() && input.exclude_url.is_some() {
            // No alternative to the excluded backend; retry against it
            // rather than failing outright, per "exclude ... when any
            // other healthy backend exists".
            (0..input.backends.len())
                .filter(|&i| input.states[i].is_eligible())
                .collect()
        } else {
            eligible
        };

        if eligible.is_empty() {
            return Err(ProxyError::NoHealthyBackend);
        }

        if input.sticky_session {
            if let Some(cookie) = input.session_cookie_value {
                if let Some(idx) = sticky_pick(&eligible, input.backends, cookie) {
                    return Ok(&input.backends[idx]);
                }
            }
        }

        let idx = weighted_pick(&eligible, input.backends);
        Ok(&input.backends[idx])
    }
}

fn sticky_pick(eligible: &[usize], backends: &[Backend], cookie: &str) -> Option<usize> {
    let total_weight: u64 = eligible.iter().map(|&i| backends[i].weight as u64).sum();
    if total_weight == 0 {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    cookie.hash(&mut hasher);
    let target = hasher.finish() % total_weight;

    let mut cumulative = 0u64;
    for &i in eligible {
        cumulative += backends[i].weight as u64;
        if target < cumulative {
            return Some(i);
        }
    }
    eligible.last().copied()
}

fn weighted_pick(eligible: &[usize], backends: &[Backend]) -> usize {
    let total_weight: u64 = eligible.iter().map(|&i| backends[i].weight as u64).sum();
    if total_weight == 0 || eligible.len() == 1 {
        return eligible[0];
    }
    let mut rng = rand::thread_rng();
    let target = rng.gen_range(0..total_weight);
    let mut cumulative = 0u64;
    for &i in eligible {
        cumulative += backends[i].weight as u64;
        if target < cumulative {
            return i;
        }
    }
    *eligible.last().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendHealth;

    fn backend(url: &str, weight: u32) -> Backend {
        Backend {
            url: url.to_string(),
            weight,
            health_check: None,
            tls: None,
        }
    }

    #[test]
    fn unknown_health_counts_as_eligible() {
        let backends = vec![backend("http://a", 100)];
        let states = vec![Arc::new(BackendState::default())];
        assert_eq!(states[0].health(), BackendHealth::Unknown);
        let input = SelectionInput {
            backends: &backends,
            states: &states,
            sticky_session: false,
            session_cookie_value: None,
            exclude_url: None,
        };
        assert_eq!(Selector::select(&input).unwrap().url, "http://a");
    }

    #[test]
    fn no_healthy_backend_errors() {
        let backends = vec![backend("http://a", 100)];
        let states = vec![Arc::new(BackendState::default())];
        states[0].record_probe(false, 2, 1, 0);
        let input = SelectionInput {
            backends: &backends,
            states: &states,
            sticky_session: false,
            session_cookie_value: None,
            exclude_url: None,
        };
        assert!(matches!(
            Selector::select(&input),
            Err(ProxyError::NoHealthyBackend)
        ));
    }

    #[test]
    fn sticky_session_is_deterministic() {
        let backends = vec![backend("http://a", 100), backend("http://b", 100)];
        let states = vec![
            Arc::new(BackendState::default()),
            Arc::new(BackendState::default()),
        ];
        let input = SelectionInput {
            backends: &backends,
            states: &states,
            sticky_session: true,
            session_cookie_value: Some("abc"),
            exclude_url: None,
        };
        let first = Selector::select(&input).unwrap().url.clone();
        for _ in 0..10 {
            assert_eq!(Selector::select(&input).unwrap().url, first);
        }
    }

    #[test]
    fn weight_1000_dominates_weight_1() {
        let backends = vec![backend("http://heavy", 1000), backend("http://light", 1)];
        let states = vec![
            Arc::new(BackendState::default()),
            Arc::new(BackendState::default()),
        ];
        let input = SelectionInput {
            backends: &backends,
            states: &states,
            sticky_session: false,
            session_cookie_value: None,
            exclude_url: None,
        };
        let mut heavy_count = 0;
        for _ in 0..2000 {
            if Selector::select(&input).unwrap().url == "http://heavy" {
                heavy_count += 1;
            }
        }
        assert!(heavy_count > 1900);
    }
}
