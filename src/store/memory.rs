use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_common::{LabelSelector, Object, object_key};
use tokio::sync::{RwLock, broadcast};

use super::{Store, WATCH_CAPACITY, WatchEvent};
use crate::errors::StoreError;

/// Process-local store. Objects are kept in key order, so listings are
/// deterministic.
pub struct MemoryStore<T> {
    objects: RwLock<BTreeMap<String, T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Object> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, event: WatchEvent<T>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Object> Store<T> for MemoryStore<T> {
    async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }

        let meta = obj.meta_mut();
        meta.resource_version = 1;
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }

        objects.insert(key, obj.clone());
        drop(objects);
        self.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let key = object_key(namespace, name);
        self.objects
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { kind: T::KIND, key })
    }

    async fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })?;

        let found = current.meta().resource_version;
        let expected = obj.meta().resource_version;
        if found != expected {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key,
                expected,
                found,
            });
        }

        let uid = current.meta().uid.clone();
        let created = current.meta().creation_timestamp;
        let meta = obj.meta_mut();
        meta.resource_version = found + 1;
        meta.uid = uid;
        meta.creation_timestamp = created;

        objects.insert(key, obj.clone());
        drop(objects);
        self.emit(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = object_key(namespace, name);
        let removed = self.objects.write().await.remove(&key);
        match removed {
            Some(obj) => {
                self.emit(WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(StoreError::NotFound { kind: T::KIND, key }),
        }
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .values()
            .filter(|obj| namespace.is_empty() || obj.namespace() == namespace)
            .filter(|obj| selector.matches(&obj.meta().labels))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
