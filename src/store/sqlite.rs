use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_common::{LabelSelector, Object, object_key};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::broadcast;

use super::{Store, WATCH_CAPACITY, WatchEvent};
use crate::errors::StoreError;

/// Async-safe handle to the object database.
///
/// Wraps `ObjectDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ObjectDb>>,
}

impl DbHandle {
    pub fn new(db: ObjectDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&ObjectDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Backend(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("DB task panicked: {}", e)))?
    }
}

/// A stored row: the JSON body plus the columns the store filters on.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub resource_version: u64,
    pub body: String,
}

pub struct ObjectDb {
    conn: Connection,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl ObjectDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        // The CLI and the controller may share one file.
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .map_err(backend)?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS objects (
                    kind TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    resource_version INTEGER NOT NULL,
                    labels TEXT NOT NULL DEFAULT '{}',
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (kind, namespace, name)
                );

                CREATE INDEX IF NOT EXISTS idx_objects_kind_ns ON objects(kind, namespace);
                ",
            )
            .map_err(backend)?;
        Ok(())
    }

    pub fn insert(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        labels: &str,
        body: &str,
    ) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO objects (kind, namespace, name, resource_version, labels, body)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![kind, namespace, name, labels, body],
            )
            .map_err(backend)?;
        Ok(inserted == 1)
    }

    pub fn fetch(&self, kind: &str, namespace: &str, name: &str) -> Result<Option<ObjectRow>, StoreError> {
        self.conn
            .query_row(
                "SELECT resource_version, body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![kind, namespace, name],
                |row| {
                    Ok(ObjectRow {
                        resource_version: row.get::<_, i64>(0)? as u64,
                        body: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }

    /// Compare-and-swap on `resource_version`. Returns false when the stored
    /// version no longer matches `expected`.
    pub fn replace(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        expected: u64,
        labels: &str,
        body: &str,
    ) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE objects
                 SET resource_version = resource_version + 1, labels = ?5, body = ?6, updated_at = datetime('now')
                 WHERE kind = ?1 AND namespace = ?2 AND name = ?3 AND resource_version = ?4",
                params![kind, namespace, name, expected as i64, labels, body],
            )
            .map_err(backend)?;
        Ok(changed == 1)
    }

    pub fn remove(&self, kind: &str, namespace: &str, name: &str) -> Result<Option<ObjectRow>, StoreError> {
        let row = self.fetch(kind, namespace, name)?;
        if row.is_some() {
            self.conn
                .execute(
                    "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                    params![kind, namespace, name],
                )
                .map_err(backend)?;
        }
        Ok(row)
    }

    /// All rows of `kind`, optionally restricted to one namespace, ordered by key.
    pub fn scan(&self, kind: &str, namespace: &str) -> Result<Vec<(String, ObjectRow)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT labels, resource_version, body FROM objects
                 WHERE kind = ?1 AND (?2 = '' OR namespace = ?2)
                 ORDER BY namespace, name",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![kind, namespace], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ObjectRow {
                        resource_version: row.get::<_, i64>(1)? as u64,
                        body: row.get(2)?,
                    },
                ))
            })
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

/// Store for one kind, backed by the shared object table.
///
/// Watch events are emitted only for writes made through this process;
/// writes from other processes are picked up by periodic resync.
pub struct SqliteStore<T> {
    db: DbHandle,
    events: broadcast::Sender<WatchEvent<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Object> SqliteStore<T> {
    pub fn new(db: DbHandle) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db,
            events,
            _kind: PhantomData,
        }
    }

    fn decode(body: &str) -> Result<T, StoreError> {
        Ok(serde_json::from_str(body)?)
    }

    fn encode(obj: &T) -> Result<(String, String), StoreError> {
        let labels = serde_json::to_string(&obj.meta().labels)?;
        let body = serde_json::to_string(obj)?;
        Ok((labels, body))
    }
}

/// The `resource_version` column is authoritative over the JSON body.
fn with_version<T: Object>(mut obj: T, version: u64) -> T {
    obj.meta_mut().resource_version = version;
    obj
}

#[async_trait]
impl<T: Object> Store<T> for SqliteStore<T> {
    async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let meta = obj.meta_mut();
        meta.resource_version = 1;
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }

        let (labels, body) = Self::encode(&obj)?;
        let namespace = obj.namespace().to_string();
        let name = obj.name().to_string();
        let inserted = self
            .db
            .call(move |db| db.insert(T::KIND, &namespace, &name, &labels, &body))
            .await?;
        if !inserted {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: obj.key(),
            });
        }

        let _ = self.events.send(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let (ns, n) = (namespace.to_string(), name.to_string());
        let row = self.db.call(move |db| db.fetch(T::KIND, &ns, &n)).await?;
        match row {
            Some(row) => Ok(with_version(Self::decode(&row.body)?, row.resource_version)),
            None => Err(StoreError::NotFound {
                kind: T::KIND,
                key: object_key(namespace, name),
            }),
        }
    }

    async fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let current = self.get(obj.namespace(), obj.name()).await?;
        let expected = obj.meta().resource_version;
        let found = current.meta().resource_version;
        if expected != found {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: obj.key(),
                expected,
                found,
            });
        }

        let meta = obj.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp;
        meta.resource_version = expected + 1;

        let (labels, body) = Self::encode(&obj)?;
        let namespace = obj.namespace().to_string();
        let name = obj.name().to_string();
        let swapped = self
            .db
            .call(move |db| db.replace(T::KIND, &namespace, &name, expected, &labels, &body))
            .await?;
        if !swapped {
            // Lost a race between the read above and the write.
            let found = self.get(obj.namespace(), obj.name()).await?.meta().resource_version;
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: obj.key(),
                expected,
                found,
            });
        }

        let _ = self.events.send(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let (ns, n) = (namespace.to_string(), name.to_string());
        let removed = self.db.call(move |db| db.remove(T::KIND, &ns, &n)).await?;
        match removed {
            Some(row) => {
                let obj = with_version(Self::decode(&row.body)?, row.resource_version);
                let _ = self.events.send(WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: T::KIND,
                key: object_key(namespace, name),
            }),
        }
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>, StoreError> {
        let ns = namespace.to_string();
        let rows = self.db.call(move |db| db.scan(T::KIND, &ns)).await?;

        let mut out = Vec::with_capacity(rows.len());
        for (labels, row) in rows {
            let labels: BTreeMap<String, String> = serde_json::from_str(&labels)?;
            if !selector.matches(&labels) {
                continue;
            }
            out.push(with_version(Self::decode(&row.body)?, row.resource_version));
        }
        Ok(out)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
