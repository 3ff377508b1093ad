//! Persisted object boundary.
//!
//! Every kind the orchestrator reads or writes goes through a [`Store`]:
//! create/get/update/delete/list with equality label selectors, plus a
//! broadcast watch stream. Updates use optimistic concurrency on
//! `metadata.resource_version`.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_common::cluster::{
    ClusterRoleBinding, ConfigMap, Namespace, NetworkPolicy, Pod, RoleBinding, Secret, Service,
    ServiceAccount, Workload,
};
use conveyor_common::{LabelSelector, Notifier, Object, Pipeline, PipelineExecution, PipelineSetting};
use tokio::sync::broadcast;

use crate::errors::StoreError;

pub use memory::MemoryStore;
pub use sqlite::{DbHandle, ObjectDb, SqliteStore};

/// Capacity of each store's watch channel. Slow receivers see `Lagged` and
/// must fall back to a full list.
pub const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

#[async_trait]
pub trait Store<T: Object>: Send + Sync {
    /// Insert a new object. Assigns `uid`, `resource_version = 1` and stamps
    /// `creation_timestamp` when the caller left it empty.
    async fn create(&self, obj: T) -> Result<T, StoreError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError>;

    /// Replace an object. Fails with `Conflict` when the caller's
    /// `resource_version` is stale.
    async fn update(&self, obj: T) -> Result<T, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// List objects in `namespace` (all namespaces when empty) matching `selector`.
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>, StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// Convenience operations layered on any [`Store`].
#[async_trait]
pub trait StoreExt<T: Object>: Store<T> {
    async fn get_optional(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create `obj` unless an object with the same key exists. Returns the
    /// stored object and whether this call created it.
    async fn create_if_absent(&self, obj: T) -> Result<(T, bool), StoreError> {
        let namespace = obj.namespace().to_string();
        let name = obj.name().to_string();
        if let Some(existing) = self.get_optional(&namespace, &name).await? {
            return Ok((existing, false));
        }
        match self.create(obj).await {
            Ok(created) => Ok((created, true)),
            Err(e) if e.is_already_exists() => Ok((self.get(&namespace, &name).await?, false)),
            Err(e) => Err(e),
        }
    }

    /// Delete, treating an already-missing object as success.
    async fn delete_if_present(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        match self.delete(namespace, name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<T: Object, S: Store<T> + ?Sized> StoreExt<T> for S {}

pub type SharedStore<T> = Arc<dyn Store<T>>;

/// One store per kind the orchestrator touches.
#[derive(Clone)]
pub struct Stores {
    pub pipelines: SharedStore<Pipeline>,
    pub executions: SharedStore<PipelineExecution>,
    pub settings: SharedStore<PipelineSetting>,
    pub notifiers: SharedStore<Notifier>,
    pub namespaces: SharedStore<Namespace>,
    pub secrets: SharedStore<Secret>,
    pub config_maps: SharedStore<ConfigMap>,
    pub service_accounts: SharedStore<ServiceAccount>,
    pub network_policies: SharedStore<NetworkPolicy>,
    pub services: SharedStore<Service>,
    pub workloads: SharedStore<Workload>,
    pub pods: SharedStore<Pod>,
    pub role_bindings: SharedStore<RoleBinding>,
    pub cluster_role_bindings: SharedStore<ClusterRoleBinding>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            pipelines: Arc::new(MemoryStore::new()),
            executions: Arc::new(MemoryStore::new()),
            settings: Arc::new(MemoryStore::new()),
            notifiers: Arc::new(MemoryStore::new()),
            namespaces: Arc::new(MemoryStore::new()),
            secrets: Arc::new(MemoryStore::new()),
            config_maps: Arc::new(MemoryStore::new()),
            service_accounts: Arc::new(MemoryStore::new()),
            network_policies: Arc::new(MemoryStore::new()),
            services: Arc::new(MemoryStore::new()),
            workloads: Arc::new(MemoryStore::new()),
            pods: Arc::new(MemoryStore::new()),
            role_bindings: Arc::new(MemoryStore::new()),
            cluster_role_bindings: Arc::new(MemoryStore::new()),
        }
    }

    /// Every kind backed by the same SQLite database.
    pub fn sqlite(db: DbHandle) -> Self {
        Self {
            pipelines: Arc::new(SqliteStore::new(db.clone())),
            executions: Arc::new(SqliteStore::new(db.clone())),
            settings: Arc::new(SqliteStore::new(db.clone())),
            notifiers: Arc::new(SqliteStore::new(db.clone())),
            namespaces: Arc::new(SqliteStore::new(db.clone())),
            secrets: Arc::new(SqliteStore::new(db.clone())),
            config_maps: Arc::new(SqliteStore::new(db.clone())),
            service_accounts: Arc::new(SqliteStore::new(db.clone())),
            network_policies: Arc::new(SqliteStore::new(db.clone())),
            services: Arc::new(SqliteStore::new(db.clone())),
            workloads: Arc::new(SqliteStore::new(db.clone())),
            pods: Arc::new(SqliteStore::new(db.clone())),
            role_bindings: Arc::new(SqliteStore::new(db.clone())),
            cluster_role_bindings: Arc::new(SqliteStore::new(db)),
        }
    }
}
