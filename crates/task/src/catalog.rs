//! Task catalog with single-flight loading
//!
//! The catalog is either fully populated or empty. Concurrent callers of
//! [`TaskCatalog::load`] share one in-flight load, and a root that fails to
//! discover tasks only costs its own tasks.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskgate_core::events::{CatalogEvent, EventEmitter};
use taskgate_core::{Result, TaskDefinition, TaskIdentity};
use taskgate_utils::Waiter;
use tracing::{debug, info, warn};

/// Immutable view of a loaded catalog.
pub type CatalogSnapshot = Arc<Vec<TaskDefinition>>;

/// Source of task definitions for one project root.
#[async_trait]
pub trait TaskDiscovery: Send + Sync {
    async fn discover_tasks(&self, project_root: &Path) -> Result<Vec<TaskDefinition>>;
}

type InFlight = Shared<BoxFuture<'static, CatalogSnapshot>>;

#[derive(Default)]
struct CatalogState {
    cache: Option<CatalogSnapshot>,
    in_flight: Option<InFlight>,
}

struct CatalogInner {
    discovery: Arc<dyn TaskDiscovery>,
    roots: Vec<PathBuf>,
    state: Mutex<CatalogState>,
    loaded: Waiter,
    events: Arc<EventEmitter>,
}

impl CatalogInner {
    async fn fetch(self: Arc<Self>) -> CatalogSnapshot {
        debug!(roots = self.roots.len(), "loading task catalog");
        let results = join_all(self.roots.iter().map(|root| {
            let discovery = self.discovery.clone();
            async move { (root, discovery.discover_tasks(root).await) }
        }))
        .await;

        let mut tasks = Vec::new();
        for (root, result) in results {
            match result {
                Ok(found) => {
                    debug!(root = %root.display(), tasks = found.len(), "discovered tasks");
                    tasks.extend(found);
                }
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "task discovery failed, skipping root");
                }
            }
        }

        let snapshot: CatalogSnapshot = Arc::new(tasks);
        {
            let mut state = self.state.lock();
            state.cache = Some(snapshot.clone());
            state.in_flight = None;
        }
        self.loaded.fire();

        info!(tasks = snapshot.len(), roots = self.roots.len(), "task catalog loaded");
        self.events.emit(CatalogEvent::Loaded {
            task_count: snapshot.len(),
            root_count: self.roots.len(),
        });
        snapshot
    }
}

/// Cached task definitions of every configured root.
#[derive(Clone)]
pub struct TaskCatalog {
    inner: Arc<CatalogInner>,
}

impl TaskCatalog {
    pub fn new(
        discovery: Arc<dyn TaskDiscovery>,
        roots: Vec<PathBuf>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                discovery,
                roots,
                state: Mutex::new(CatalogState::default()),
                loaded: Waiter::new(),
                events,
            }),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.inner.roots
    }

    /// Return the cached catalog, joining or starting a load when the cache
    /// is empty.
    pub async fn load(&self) -> CatalogSnapshot {
        let in_flight = {
            let mut state = self.inner.state.lock();
            if let Some(cache) = state.cache.as_ref().filter(|cache| !cache.is_empty()) {
                return cache.clone();
            }
            match &state.in_flight {
                Some(in_flight) => {
                    debug!("joining in-flight catalog load");
                    in_flight.clone()
                }
                None => {
                    let load = self.inner.clone().fetch().boxed().shared();
                    state.in_flight = Some(load.clone());
                    load
                }
            }
        };
        in_flight.await
    }

    /// Clear the cache. A load already in flight still populates it when it
    /// finishes.
    pub fn invalidate(&self) {
        let cleared = self.inner.state.lock().cache.take().is_some();
        self.inner.loaded.reset();
        if cleared {
            debug!("task catalog invalidated");
            self.inner.events.emit(CatalogEvent::Invalidated);
        }
    }

    pub async fn refresh(&self) -> CatalogSnapshot {
        self.invalidate();
        self.load().await
    }

    /// Resolves once a load has populated the catalog.
    pub async fn wait_until_loaded(&self) {
        self.inner.loaded.wait().await;
    }

    pub fn snapshot(&self) -> Option<CatalogSnapshot> {
        self.inner.state.lock().cache.clone()
    }

    pub fn find(&self, identity: &TaskIdentity) -> Option<TaskDefinition> {
        self.snapshot()?
            .iter()
            .find(|definition| &definition.identity == identity)
            .cloned()
    }

    /// Look a task up by task path or script path such as `app:build`.
    pub fn find_by_name(&self, name: &str) -> Option<TaskDefinition> {
        self.snapshot()?
            .iter()
            .find(|definition| {
                definition.identity.task_path == name || definition.script_path == name
            })
            .cloned()
    }
}
