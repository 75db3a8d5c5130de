//! Route Store: the authoritative, versioned set of [`Route`](crate::model::Route)
//! definitions consumed by the Router, with a watch channel for updates.
//!
//! `apply` is serialized (at most one in flight at a time) and validates the
//! resulting snapshot as a whole before the swap; readers never observe a
//! partially updated snapshot.

mod file_snapshot;
mod memory;

pub use file_snapshot::FileSnapshotRouteStore;
pub use memory::InMemoryRouteStore;

use crate::error::RouteStoreError;
use crate::model::{Route, Snapshot, SnapshotVersion};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Driver interface consumed by the core. In-memory and file-snapshot
/// drivers are implemented here; SQLite/ConfigMap/CRD drivers are external
/// collaborators that would implement this same trait.
#[async_trait]
pub trait RouteStoreDriver: Send + Sync {
    async fn list(&self) -> (SnapshotVersion, Vec<Route>);

    /// Lazy, infinite stream of `(version, routes)`, emitted on every
    /// successful commit. Slow consumers receive only the latest snapshot;
    /// no consumer blocks a writer.
    fn watch(&self) -> broadcast::Receiver<Snapshot>;

    /// Validates the candidate snapshot as a whole and swaps atomically.
    /// Implementations must serialize concurrent callers.
    async fn apply(&self, routes: Vec<Route>) -> Result<SnapshotVersion, RouteStoreError>;

    fn current(&self) -> std::sync::Arc<Snapshot>;
}
