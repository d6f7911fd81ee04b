//! Plugin info store: the durable record of every known plugin.

use std::sync::Arc;

use async_trait::async_trait;
use keel_storage::{KvStore, ScopedKvStore, StorageError};
use tracing::warn;

use crate::error::PluginResult;
use crate::model::PluginRecord;
use crate::plugin::PluginId;

/// Default namespace for plugin records.
pub const DEFAULT_NAMESPACE: &str = "plugins";

/// Keyed persistence of [`PluginRecord`]s, one per plugin id.
#[async_trait]
pub trait InfoStore: Send + Sync {
    /// Every record, sorted by plugin id.
    async fn list(&self) -> PluginResult<Vec<PluginRecord>>;

    /// The record for `id`.
    async fn get(&self, id: &PluginId) -> PluginResult<Option<PluginRecord>>;

    /// Insert or replace the record for `record.id()`.
    async fn save(&self, record: &PluginRecord) -> PluginResult<()>;

    /// Delete the record for `id`. Returns whether one existed.
    async fn delete(&self, id: &PluginId) -> PluginResult<bool>;
}

/// Info store over a namespaced key/value store, one JSON document per id.
#[derive(Debug, Clone)]
pub struct KvInfoStore {
    store: ScopedKvStore,
}

impl KvInfoStore {
    /// Bind to `namespace` of `store`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the namespace is invalid.
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> PluginResult<Self> {
        Ok(Self {
            store: ScopedKvStore::new(store, namespace)?,
        })
    }
}

#[async_trait]
impl InfoStore for KvInfoStore {
    async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        let documents = self.store.list_json::<PluginRecord>().await?;
        let mut records = Vec::with_capacity(documents.len());
        for (key, document) in documents {
            match document {
                Ok(record) if record.id().as_str() == key => records.push(record),
                Ok(record) => {
                    warn!(key = %key, plugin_id = %record.id(), "record stored under a foreign key, skipping");
                },
                Err(e) => warn!(key = %key, error = %e, "unreadable plugin record, skipping"),
            }
        }
        Ok(records)
    }

    async fn get(&self, id: &PluginId) -> PluginResult<Option<PluginRecord>> {
        Ok(self.store.get_json(id.as_str()).await?)
    }

    async fn save(&self, record: &PluginRecord) -> PluginResult<()> {
        Ok(self.store.put_json(record.id().as_str(), record).await?)
    }

    async fn delete(&self, id: &PluginId) -> PluginResult<bool> {
        Ok(self.store.delete(id.as_str()).await?)
    }
}

/// Read-through view that rejects writes.
#[derive(Clone)]
pub struct ReadOnlyInfoStore {
    inner: Arc<dyn InfoStore>,
}

impl ReadOnlyInfoStore {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn InfoStore>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for ReadOnlyInfoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyInfoStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl InfoStore for ReadOnlyInfoStore {
    async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        self.inner.list().await
    }

    async fn get(&self, id: &PluginId) -> PluginResult<Option<PluginRecord>> {
        self.inner.get(id).await
    }

    async fn save(&self, record: &PluginRecord) -> PluginResult<()> {
        Err(StorageError::ReadOnly(format!("cannot save plugin record {}", record.id())).into())
    }

    async fn delete(&self, id: &PluginId) -> PluginResult<bool> {
        Err(StorageError::ReadOnly(format!("cannot delete plugin record {id}")).into())
    }
}
