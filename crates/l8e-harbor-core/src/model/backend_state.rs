use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

/// Runtime companion for a [`super::Backend`], never persisted. Lives in a
/// side table keyed by backend URL so routes never hold a cyclic reference
/// into mutable state.
#[derive(Debug)]
pub struct BackendState {
    health: RwLock<BackendHealth>,
    consecutive_success: AtomicU32,
    consecutive_failure: AtomicU32,
    last_probe_at: AtomicU64,
    in_flight_count: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Up,
    Down,
    Unknown,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            health: RwLock::new(BackendHealth::Unknown),
            consecutive_success: AtomicU32::new(0),
            consecutive_failure: AtomicU32::new(0),
            last_probe_at: AtomicU64::new(0),
            in_flight_count: AtomicU32::new(0),
        }
    }
}

impl BackendState {
    pub fn health(&self) -> BackendHealth {
        *self.health.read().expect("backend state poisoned")
    }

    pub fn is_eligible(&self) -> bool {
        !matches!(self.health(), BackendHealth::Down)
    }

    /// Applies one probe outcome and returns the resulting health, per the
    /// prober's threshold-driven state machine.
    pub fn record_probe(
        &self,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        now_unix_ms: u64,
    ) -> BackendHealth {
        self.last_probe_at.store(now_unix_ms, Ordering::Relaxed);
        let mut health = self.health.write().expect("backend state poisoned");
        if success {
            self.consecutive_failure.store(0, Ordering::Relaxed);
            let successes = self.consecutive_success.fetch_add(1, Ordering::Relaxed) + 1;
            if matches!(*health, BackendHealth::Unknown | BackendHealth::Down)
                && successes >= healthy_threshold
            {
                *health = BackendHealth::Up;
            }
        } else {
            self.consecutive_success.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failure.fetch_add(1, Ordering::Relaxed) + 1;
            if matches!(*health, BackendHealth::Unknown | BackendHealth::Up)
                && failures >= unhealthy_threshold
            {
                *health = BackendHealth::Down;
            }
        }
        *health
    }

    pub fn enter_flight(&self) {
        self.in_flight_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_flight(&self) {
        self.in_flight_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight_count.load(Ordering::Relaxed)
    }
}
