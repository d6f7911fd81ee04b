//! Keyed document persistence behind the plugin info store.
//!
//! A [`KvStore`] holds opaque byte values grouped into namespaces. The plugin
//! subsystem only needs put, get, list and delete; [`ScopedKvStore`] binds a
//! namespace and adds the JSON encoding used for plugin records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::fs_util::{TEMP_PREFIX, blocking, validate_segment, write_atomic};

/// Namespaced byte storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace `key` in `namespace`.
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// The value of `key`, if present.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Every entry of `namespace`, ordered by key. An unknown namespace is
    /// empty.
    async fn list(&self, namespace: &str) -> StorageResult<BTreeMap<String, Vec<u8>>>;

    /// Remove `key`. Returns whether it was present.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;
}

fn require_non_empty(kind: &str, value: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::InvalidKey(format!("{kind} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        require_non_empty("namespace", namespace)?;
        require_non_empty("key", key)?;
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn list(&self, namespace: &str) -> StorageResult<BTreeMap<String, Vec<u8>>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces
            .get_mut(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }
}

// ---------------------------------------------------------------------------
// File implementation
// ---------------------------------------------------------------------------

const VALUE_EXTENSION: &str = "json";

/// Directory-backed store: `{root}/{namespace}/{key}.json`.
///
/// Values are written to a temp file and renamed into place, so readers in
/// other processes see either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    /// Open `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> StorageResult<PathBuf> {
        validate_segment("namespace", namespace)?;
        Ok(self.root.join(namespace))
    }

    fn value_path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        validate_segment("key", key)?;
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{key}.{VALUE_EXTENSION}")))
    }
}

fn read_namespace(dir: &Path) -> StorageResult<BTreeMap<String, Vec<u8>>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let suffix = format!(".{VALUE_EXTENSION}");
    let mut values = BTreeMap::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(TEMP_PREFIX) || !entry.file_type()?.is_file() {
            continue;
        }
        let Some(key) = name.strip_suffix(&suffix) else {
            continue;
        };
        match std::fs::read(entry.path()) {
            Ok(bytes) => {
                values.insert(key.to_string(), bytes);
            },
            // Deleted between the listing and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(values)
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let path = self.value_path(namespace, key)?;
        blocking(move || write_atomic(&path, &value, true)).await
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.value_path(namespace, key)?;
        blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn list(&self, namespace: &str) -> StorageResult<BTreeMap<String, Vec<u8>>> {
        let dir = self.namespace_dir(namespace)?;
        blocking(move || read_namespace(&dir)).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let path = self.value_path(namespace, key)?;
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Scoped store
// ---------------------------------------------------------------------------

/// One namespace of a [`KvStore`], holding JSON documents.
#[derive(Clone)]
pub struct ScopedKvStore {
    inner: Arc<dyn KvStore>,
    namespace: String,
}

impl std::fmt::Debug for ScopedKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedKvStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ScopedKvStore {
    /// Bind `namespace` of `store`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for an empty namespace.
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        require_non_empty("namespace", &namespace)?;
        Ok(Self {
            inner: store,
            namespace,
        })
    }

    /// The bound namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Decode the document at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the stored bytes are not a
    /// valid `T`, or the backend's error.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> StorageResult<Option<T>> {
        self.inner
            .get(&self.namespace, key)
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Encode `value` and store it at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] or the backend's error.
    pub async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.inner.put(&self.namespace, key, bytes).await
    }

    /// Every document, ordered by key, each decoded on its own so that one
    /// corrupt value does not hide the others.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the namespace cannot be listed.
    pub async fn list_json<T: serde::de::DeserializeOwned>(
        &self,
    ) -> StorageResult<Vec<(String, StorageResult<T>)>> {
        Ok(self
            .inner
            .list(&self.namespace)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode(&bytes);
                (key, value)
            })
            .collect())
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.inner.delete(&self.namespace, key).await
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
