use super::{InMemoryRouteStore, RouteStoreDriver};
use crate::error::RouteStoreError;
use crate::model::{Route, Snapshot, SnapshotVersion};
use async_trait::async_trait;
use log::{error, info, warn};
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Persists the full snapshot as YAML at `path` on every successful commit
/// and on a periodic interval; loads the newest valid file at startup.
///
/// Wraps an [`InMemoryRouteStore`] for the in-process hot path and adds
/// durability. File changes made out of band (e.g. by an operator editing
/// the file directly) are picked up by a `notify` watch, falling back to
/// interval polling if the platform watch cannot be installed — matching
/// the teacher's mtime-poll loop but upgraded to event-driven detection.
pub struct FileSnapshotRouteStore {
    inner: InMemoryRouteStore,
    path: PathBuf,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OnDiskSnapshot {
    version: SnapshotVersion,
    routes: Vec<Route>,
}

impl FileSnapshotRouteStore {
    /// Loads the newest valid file at `path` if it exists, otherwise starts
    /// from an empty route set.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RouteStoreError> {
        let path = path.into();
        let routes = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let on_disk: OnDiskSnapshot = serde_yaml::from_str(&contents)
                    .map_err(|e| RouteStoreError::Serde(e.to_string()))?;
                on_disk.routes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("route snapshot file {path:?} not found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(RouteStoreError::Io(e)),
        };
        let inner = InMemoryRouteStore::new(routes)?;
        Ok(Self { inner, path })
    }

    async fn persist(&self, snapshot: &Arc<Snapshot>) -> Result<(), RouteStoreError> {
        let on_disk = OnDiskSnapshot {
            version: snapshot.version,
            routes: snapshot.routes.clone(),
        };
        let yaml = serde_yaml::to_string(&on_disk)
            .map_err(|e| RouteStoreError::Serde(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&self.path, yaml).await?;
        Ok(())
    }

    /// Spawns the periodic persistence tick and the change-notification
    /// watcher. Must be called once after construction; safe to call from
    /// the gateway's startup sequence.
    pub fn spawn_background_tasks(self: &Arc<Self>, persist_interval: Duration) {
        let persist_handle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persist_interval);
            loop {
                ticker.tick().await;
                let snapshot = persist_handle.inner.current();
                if let Err(e) = persist_handle.persist(&snapshot).await {
                    error!("periodic route snapshot persist failed: {e}");
                }
            }
        });

        let watch_handle = Arc::clone(self);
        tokio::spawn(async move {
            watch_handle.run_file_watch().await;
        });
    }

    async fn run_file_watch(self: Arc<Self>) {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let path = self.path.clone();
        let watcher_result = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        });

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(e) => {
                warn!("file watcher unavailable ({e}), falling back to interval polling");
                self.poll_loop().await;
                return;
            }
        };

        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("failed to watch {path:?} ({e}), falling back to interval polling");
            self.poll_loop().await;
            return;
        }

        while let Some(event) = rx.recv().await {
            match event {
                Ok(_) => {
                    if let Err(e) = self.reload_from_disk().await {
                        error!("route snapshot reload after fs event failed: {e}");
                    }
                }
                Err(e) => warn!("file watch error: {e}"),
            }
        }
    }

    async fn poll_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        let mut last_modified = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        loop {
            ticker.tick().await;
            let modified = tokio::fs::metadata(&self.path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            if modified.is_some() && modified != last_modified {
                if let Err(e) = self.reload_from_disk().await {
                    error!("route snapshot reload failed: {e}");
                } else {
                    last_modified = modified;
                }
            }
        }
    }

    async fn reload_from_disk(&self) -> Result<(), RouteStoreError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let on_disk: OnDiskSnapshot =
            serde_yaml::from_str(&contents).map_err(|e| RouteStoreError::Serde(e.to_string()))?;
        self.inner.apply(on_disk.routes).await?;
        info!("route snapshot reloaded from {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl RouteStoreDriver for FileSnapshotRouteStore {
    async fn list(&self) -> (SnapshotVersion, Vec<Route>) {
        self.inner.list().await
    }

    fn watch(&self) -> broadcast::Receiver<Snapshot> {
        self.inner.watch()
    }

    async fn apply(&self, routes: Vec<Route>) -> Result<SnapshotVersion, RouteStoreError> {
        let version = self.inner.apply(routes).await?;
        self.persist(&self.inner.current()).await?;
        Ok(version)
    }

    fn current(&self) -> Arc<Snapshot> {
        self.inner.current()
    }
}
