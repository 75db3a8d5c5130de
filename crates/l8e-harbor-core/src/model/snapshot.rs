use super::Route;
use std::sync::atomic::{AtomicU64, Ordering};

pub type SnapshotVersion = u64;

/// An immutable, versioned set of routes published by the Route Store.
/// Readers hold a reference to one `Snapshot` for the life of a request, so
/// an in-flight request observes a consistent world even if the store
/// publishes a newer snapshot mid-flight.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: SnapshotVersion,
    pub routes: Vec<Route>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            routes: Vec::new(),
        }
    }

    pub fn new(version: SnapshotVersion, routes: Vec<Route>) -> Self {
        Self { version, routes }
    }

    /// Validates the whole candidate snapshot: every route individually,
    /// plus the cross-route duplicate-id check. Does not error on
    /// same-priority ties for otherwise-distinct ids — those are resolved
    /// deterministically by the Router's id tie-break, per §4.2.
    pub fn validate(routes: &[Route]) -> Result<(), String> {
        let mut seen_ids = ahash::AHashSet::default();
        for r in routes {
            r.validate()?;
            if !seen_ids.insert(r.id.as_str()) {
                return Err(format!("duplicate route id: {}", r.id));
            }
        }
        Ok(())
    }
}

/// Monotonic version counter shared by a Route Store driver and its
/// watchers, mirroring the `AtomicU64` version token in the teacher's
/// config hot-reload watcher.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn next(&self) -> SnapshotVersion {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> SnapshotVersion {
        self.0.load(Ordering::SeqCst)
    }
}
