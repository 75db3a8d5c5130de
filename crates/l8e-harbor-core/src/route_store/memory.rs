use super::RouteStoreDriver;
use crate::error::RouteStoreError;
use crate::model::{Route, Snapshot, SnapshotVersion, VersionCounter};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Readers hold a stable `Arc<Snapshot>` for the life of a request via
/// [`ArcSwap`]'s lock-free load, matching the reference-swap requirement in
/// the concurrency model: a snapshot, once published, is immutable.
pub struct InMemoryRouteStore {
    current: ArcSwap<Snapshot>,
    version_counter: VersionCounter,
    update_sender: broadcast::Sender<Snapshot>,
    /// Serializes `apply` calls; at most one commit in flight at a time.
    write_lock: Mutex<()>,
}

impl InMemoryRouteStore {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteStoreError> {
        Snapshot::validate(&routes).map_err(RouteStoreError::InvalidRouteSet)?;
        let version_counter = VersionCounter::default();
        let version = version_counter.next();
        let (update_sender, _) = broadcast::channel(128);
        Ok(Self {
            current: ArcSwap::from_pointee(Snapshot::new(version, routes)),
            version_counter,
            update_sender,
            write_lock: Mutex::new(()),
        })
    }

    pub fn empty() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            version_counter: VersionCounter::default(),
            update_sender: broadcast::channel(128).0,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RouteStoreDriver for InMemoryRouteStore {
    async fn list(&self) -> (SnapshotVersion, Vec<Route>) {
        let snap = self.current.load();
        (snap.version, snap.routes.clone())
    }

    fn watch(&self) -> broadcast::Receiver<Snapshot> {
        self.update_sender.subscribe()
    }

    async fn apply(&self, routes: Vec<Route>) -> Result<SnapshotVersion, RouteStoreError> {
        let _guard = self.write_lock.lock().await;
        Snapshot::validate(&routes).map_err(RouteStoreError::InvalidRouteSet)?;

        let existing = self.current.load();
        if existing.routes == routes {
            return Ok(existing.version);
        }

        let version = self.version_counter.next();
        let snapshot = Snapshot::new(version, routes);
        self.current.store(Arc::new(snapshot.clone()));
        // A lagging watcher only ever misses intermediate snapshots, never
        // observes a torn one; `send` failing just means no subscribers yet.
        if self.update_sender.send(snapshot).is_err() {
            info!("route store: no active watchers for snapshot v{version}");
        }
        Ok(version)
    }

    fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Backend, Route};

    fn route(id: &str) -> Route {
        Route {
            id: id.to_string(),
            description: None,
            path: "/x".to_string(),
            methods: vec![],
            priority: 0,
            strip_prefix: false,
            add_prefix: None,
            timeout_ms: 1000,
            sticky_session: false,
            session_cookie: "sid".to_string(),
            matchers: vec![],
            backends: vec![Backend {
                url: "http://a".to_string(),
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

    #[tokio::test]
    async fn reapplying_the_same_route_set_is_a_no_op() {
        let store = InMemoryRouteStore::new(vec![route("r1")]).unwrap();
        let v0 = store.current().version;

        let v1 = store.apply(vec![route("r1")]).await.unwrap();
        assert_eq!(v1, v0, "no change in routes must not bump the version");

        let v2 = store.apply(vec![route("r1")]).await.unwrap();
        assert_eq!(v2, v0);
    }

    #[tokio::test]
    async fn applying_a_changed_route_set_bumps_the_version_once() {
        let store = InMemoryRouteStore::new(vec![route("r1")]).unwrap();
        let v0 = store.current().version;

        let v1 = store.apply(vec![route("r1"), route("r2")]).await.unwrap();
        assert_eq!(v1, v0 + 1);

        let v2 = store.apply(vec![route("r1"), route("r2")]).await.unwrap();
        assert_eq!(v2, v1);
    }
}
