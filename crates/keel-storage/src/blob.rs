//! Path-addressed blob storage.
//!
//! [`BlobStore`] is the interface the plugin subsystem uses for the shared
//! remote package repository. Paths are repository-relative, `/`-separated
//! strings such as `plugins/foo.pkg`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::fs_util::{TEMP_PREFIX, blocking, write_atomic};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a repository-relative path.
///
/// Rejects empty paths, absolute paths, backslashes, and `.`/`..` or empty
/// segments, so a path can never escape the repository root.
fn validate_path(path: &str) -> StorageResult<()> {
    if path.is_empty() {
        return Err(StorageError::InvalidKey("path must not be empty".into()));
    }
    if path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(StorageError::InvalidKey(format!(
            "path must be relative and '/'-separated: {path}"
        )));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::InvalidKey(format!(
                "path contains an invalid segment: {path}"
            )));
        }
        if segment.starts_with(TEMP_PREFIX) {
            return Err(StorageError::InvalidKey(format!(
                "path uses a reserved name: {path}"
            )));
        }
    }
    Ok(())
}

fn normalize_parent(parent: Option<&str>) -> StorageResult<Option<String>> {
    match parent.map(|p| p.trim_end_matches('/')) {
        None | Some("") => Ok(None),
        Some(p) => {
            validate_path(p)?;
            Ok(Some(p.to_string()))
        },
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Opaque blob store addressed by relative paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. Returns `None` if it does not exist.
    async fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Create a blob that must not already exist.
    ///
    /// Fails with [`StorageError::AlreadyExists`] otherwise.
    async fn create(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Replace a blob that must already exist.
    ///
    /// Fails with [`StorageError::NotFound`] otherwise.
    async fn update(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Create or replace a blob.
    async fn upsert(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Delete a blob. Returns `true` if it existed; deleting a missing blob is
    /// not an error.
    async fn delete(&self, path: &str) -> StorageResult<bool>;

    /// List every blob path under `parent` (or the whole store), recursively,
    /// in lexical order.
    async fn list_paths(&self, parent: Option<&str>) -> StorageResult<Vec<String>>;

    /// Check whether a blob exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: std::sync::RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_path(path)?;
        let blobs = self
            .blobs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(blobs.get(path).cloned())
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        validate_path(path)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        if blobs.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        blobs.insert(path.to_string(), data);
        Ok(())
    }

    async fn update(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        validate_path(path)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        match blobs.get_mut(path) {
            Some(existing) => {
                *existing = data;
                Ok(())
            },
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    async fn upsert(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        validate_path(path)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        blobs.insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        validate_path(path)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(blobs.remove(path).is_some())
    }

    async fn list_paths(&self, parent: Option<&str>) -> StorageResult<Vec<String>> {
        let parent = normalize_parent(parent)?;
        let blobs = self
            .blobs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(blobs
            .keys()
            .filter(|k| {
                parent
                    .as_deref()
                    .is_none_or(|p| k.strip_prefix(p).is_some_and(|rest| rest.starts_with('/')))
            })
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        validate_path(path)?;
        let blobs = self
            .blobs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(blobs.contains_key(path))
    }
}

// ---------------------------------------------------------------------------
// File implementation
// ---------------------------------------------------------------------------

/// Blob store rooted at a local directory.
///
/// Writes are atomic (temp file + rename in the target directory). Listing
/// walks the tree recursively and reports `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
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

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, s| acc.join(s)))
    }
}

fn walk_blobs(root: &Path, base: &Path) -> StorageResult<Vec<String>> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(base).sort_by_file_name() {
        let entry = entry.map_err(|e| StorageError::Internal(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(TEMP_PREFIX)
        {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(joined);
    }
    out.sort();
    Ok(out)
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        blocking(move || match std::fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let target = self.resolve(path)?;
        blocking(move || write_atomic(&target, &data, false)).await?;
        debug!(path, "created blob");
        Ok(())
    }

    async fn update(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let owned = path.to_string();
        blocking(move || {
            if !target.is_file() {
                return Err(StorageError::NotFound(owned));
            }
            write_atomic(&target, &data, true)
        })
        .await
    }

    async fn upsert(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let target = self.resolve(path)?;
        blocking(move || write_atomic(&target, &data, true)).await?;
        debug!(path, "upserted blob");
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        blocking(move || match std::fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn list_paths(&self, parent: Option<&str>) -> StorageResult<Vec<String>> {
        let base = match normalize_parent(parent)? {
            Some(p) => self.resolve(&p)?,
            None => self.root.clone(),
        };
        let root = self.root.clone();
        blocking(move || walk_blobs(&root, &base)).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        blocking(move || Ok(target.is_file())).await
    }
}

// ---------------------------------------------------------------------------
// Read-only wrapper
// ---------------------------------------------------------------------------

/// A view over another [`BlobStore`] that rejects every write.
#[derive(Clone)]
pub struct ReadOnlyBlobStore {
    inner: Arc<dyn BlobStore>,
}

impl ReadOnlyBlobStore {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for ReadOnlyBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyBlobStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl BlobStore for ReadOnlyBlobStore {
    async fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.read(path).await
    }

    async fn create(&self, path: &str, _data: Vec<u8>) -> StorageResult<()> {
        Err(StorageError::ReadOnly(format!("create {path}")))
    }

    async fn update(&self, path: &str, _data: Vec<u8>) -> StorageResult<()> {
        Err(StorageError::ReadOnly(format!("update {path}")))
    }

    async fn upsert(&self, path: &str, _data: Vec<u8>) -> StorageResult<()> {
        Err(StorageError::ReadOnly(format!("upsert {path}")))
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        Err(StorageError::ReadOnly(format!("delete {path}")))
    }

    async fn list_paths(&self, parent: Option<&str>) -> StorageResult<Vec<String>> {
        self.inner.list_paths(parent).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("plugins/foo.pkg").is_ok());
        assert!(validate_path("foo.pkg").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/abs.pkg").is_err());
        assert!(validate_path("plugins/../etc/passwd").is_err());
        assert!(validate_path("plugins//foo.pkg").is_err());
        assert!(validate_path("plugins\\foo.pkg").is_err());
        assert!(validate_path(".keel-tmp-123").is_err());
    }

    #[tokio::test]
    async fn memory_create_update_semantics() {
        let store = MemoryBlobStore::new();
        store.create("a.pkg", b"1".to_vec()).await.unwrap();
        assert!(matches!(
            store.create("a.pkg", b"2".to_vec()).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.update("b.pkg", b"2".to_vec()).await,
            Err(StorageError::NotFound(_))
        ));
        store.update("a.pkg", b"3".to_vec()).await.unwrap();
        assert_eq!(store.read("a.pkg").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn memory_list_respects_parent() {
        let store = MemoryBlobStore::new();
        store.upsert("plugins/a.pkg", vec![]).await.unwrap();
        store.upsert("plugins/nested/b.pkg", vec![]).await.unwrap();
        store.upsert("pluginsx/c.pkg", vec![]).await.unwrap();
        store.upsert("top.pkg", vec![]).await.unwrap();

        assert_eq!(
            store.list_paths(Some("plugins")).await.unwrap(),
            vec!["plugins/a.pkg", "plugins/nested/b.pkg"]
        );
        assert_eq!(store.list_paths(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn file_store_lists_relative_paths_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        store.upsert("plugins/foo.pkg", b"x".to_vec()).await.unwrap();
        store.upsert("plugins/deep/bar.pkg", b"y".to_vec()).await.unwrap();
        store.upsert("root.pkg", b"z".to_vec()).await.unwrap();

        assert_eq!(
            store.list_paths(None).await.unwrap(),
            vec!["plugins/deep/bar.pkg", "plugins/foo.pkg", "root.pkg"]
        );
        assert_eq!(
            store.list_paths(Some("plugins/")).await.unwrap(),
            vec!["plugins/deep/bar.pkg", "plugins/foo.pkg"]
        );
        assert!(store.list_paths(Some("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_delete_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        assert!(!store.delete("nothing.pkg").await.unwrap());
        store.upsert("x.pkg", vec![1]).await.unwrap();
        assert!(store.exists("x.pkg").await.unwrap());
        assert!(store.delete("x.pkg").await.unwrap());
        assert!(!store.exists("x.pkg").await.unwrap());
    }

    #[tokio::test]
    async fn file_store_create_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        store.create("x.pkg", b"old".to_vec()).await.unwrap();
        assert!(matches!(
            store.create("x.pkg", b"new".to_vec()).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(store.read("x.pkg").await.unwrap(), Some(b"old".to_vec()));
    }

    #[tokio::test]
    async fn read_only_rejects_writes_but_reads_through() {
        let inner: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        inner.upsert("a.pkg", b"1".to_vec()).await.unwrap();
        let ro = ReadOnlyBlobStore::new(Arc::clone(&inner));

        assert_eq!(ro.read("a.pkg").await.unwrap(), Some(b"1".to_vec()));
        assert!(matches!(
            ro.upsert("a.pkg", vec![]).await,
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(
            ro.delete("a.pkg").await,
            Err(StorageError::ReadOnly(_))
        ));
        assert!(inner.exists("a.pkg").await.unwrap());
    }
}
