//! Data model for routes, backends, and their runtime companion state.
//!
//! Routes are configuration: immutable once published in a [`Snapshot`].
//! Backend runtime state (health, in-flight counters) lives in a side table
//! keyed by backend URL rather than on the route itself, so routes never
//! carry cyclic references into mutable state.

mod backend_state;
mod route;
mod snapshot;

pub use backend_state::{BackendHealth, BackendState};
pub use route::{
    Backend, CircuitBreakerPolicy, HealthCheckConfig, Matcher, MatcherOp, MatcherSource, Route,
    RetryPolicy, TlsConfig,
};
pub use snapshot::{Snapshot, SnapshotVersion};
