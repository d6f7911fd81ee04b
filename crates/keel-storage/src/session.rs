//! TTL caches with an atomic insert-if-absent primitive.
//!
//! A [`SessionCache`] is the shared store behind the plugin subsystem's
//! ephemeral lock: entries expire on their own after the configured TTL, so a
//! holder that crashes never blocks a key forever.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::fs_util::{TEMP_PREFIX, blocking, write_atomic};

/// Longest key accepted by [`FileSessionCache`] (hex encoding doubles it).
const MAX_FILE_KEY_LEN: usize = 120;

/// Extension of the marker a writer holds while reclaiming an expired entry.
const RECLAIM_EXTENSION: &str = "reclaim";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A string-to-string cache whose entries expire after a fixed TTL.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Insert or replace an entry, resetting its TTL.
    async fn put(&self, key: &str, value: String) -> StorageResult<()>;

    /// Read a live entry.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Remove an entry. Returns `true` if a live entry was removed.
    async fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Insert only if no live entry exists for `key`.
    ///
    /// Returns `true` if this call inserted the entry. The check and the
    /// insert are a single atomic step.
    async fn put_if_absent(&self, key: &str, value: String) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local TTL cache backed by `moka`.
///
/// Suitable for single-host deployments and for simulating several hosts in
/// tests (share one instance between them).
#[derive(Clone)]
pub struct MemorySessionCache {
    cache: Cache<String, String>,
    ttl: Duration,
}

impl MemorySessionCache {
    /// Create a cache with the given entry TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache, ttl }
    }

    /// The configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for MemorySessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn put(&self, key: &str, value: String) -> StorageResult<()> {
        self.cache.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.cache.get(key))
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        Ok(self.cache.remove(key).is_some())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> StorageResult<bool> {
        let entry = self.cache.entry(key.to_string()).or_insert_with(|| value);
        Ok(entry.is_fresh())
    }
}

// ---------------------------------------------------------------------------
// File implementation
// ---------------------------------------------------------------------------

/// TTL cache shared between processes through a directory.
///
/// Each entry is one file named after the hex-encoded key. Insert-if-absent
/// relies on exclusive file creation; an entry whose modification time is
/// older than the TTL is treated as absent and reclaimed by the next writer.
/// Only one writer reclaims a given entry at a time.
#[derive(Debug, Clone)]
pub struct FileSessionCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FileSessionCache {
    /// Open (and create if needed) a cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> StorageResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, ttl })
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("key must not be empty".into()));
        }
        if key.len() > MAX_FILE_KEY_LEN {
            return Err(StorageError::InvalidKey(format!(
                "key longer than {MAX_FILE_KEY_LEN} bytes"
            )));
        }
        Ok(self.dir.join(hex::encode(key)))
    }
}

fn is_expired(path: &Path, ttl: Duration) -> StorageResult<bool> {
    let modified = match std::fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(modified.elapsed().is_ok_and(|age| age > ttl))
}

fn remove_if_present(path: &Path) -> StorageResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Exclusively create `path` holding `value`. `Ok(false)` if it exists.
///
/// A failed write removes the half-created entry so it cannot hold the key
/// for a whole TTL.
fn create_entry(path: &Path, value: &str) -> StorageResult<bool> {
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let written = file
        .write_all(value.as_bytes())
        .and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        if let Err(cleanup) = remove_if_present(path) {
            warn!(path = %path.display(), error = %cleanup, "failed to discard partial session entry");
        }
        return Err(e.into());
    }
    Ok(true)
}

/// Marker held while one writer reclaims an expired entry. Removed on drop.
struct ReclaimMarker {
    path: PathBuf,
}

impl ReclaimMarker {
    /// Take the marker for `entry`, or `None` if another writer holds a live
    /// one. A marker older than `ttl` belongs to a crashed writer and is
    /// cleared, and this attempt still reports `None`.
    fn acquire(entry: &Path, ttl: Duration) -> StorageResult<Option<Self>> {
        let path = entry.with_extension(RECLAIM_EXTENSION);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if is_expired(&path, ttl)? {
                    remove_if_present(&path)?;
                }
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ReclaimMarker {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove reclaim marker");
        }
    }
}

/// A unique sibling name for moving `entry` out of the way.
fn tombstone_path(entry: &Path) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = entry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    entry.with_file_name(format!(
        "{TEMP_PREFIX}{name}-{}-{seq}",
        std::process::id()
    ))
}

/// Replace an expired entry at `path` with a fresh one holding `value`.
///
/// Reclaimers serialise on a [`ReclaimMarker`]. Under the marker the expired
/// entry is renamed to a unique tombstone and its age is checked again: if
/// the tombstone turns out to be live it is linked back and the key stays
/// with its holder.
fn reclaim(path: &Path, value: &str, ttl: Duration) -> StorageResult<bool> {
    let Some(_marker) = ReclaimMarker::acquire(path, ttl)? else {
        return Ok(false);
    };
    if !is_expired(path, ttl)? {
        return Ok(false);
    }

    let tombstone = tombstone_path(path);
    match std::fs::rename(path, &tombstone) {
        Ok(()) => {},
        // Released by its holder in the meantime.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return create_entry(path, value),
        Err(e) => return Err(e.into()),
    }

    if !is_expired(&tombstone, ttl)? {
        let restored = std::fs::hard_link(&tombstone, path);
        remove_if_present(&tombstone)?;
        if let Err(e) = restored {
            warn!(path = %path.display(), error = %e, "failed to restore live session entry");
        }
        return Ok(false);
    }
    remove_if_present(&tombstone)?;
    create_entry(path, value)
}

#[async_trait]
impl SessionCache for FileSessionCache {
    async fn put(&self, key: &str, value: String) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        blocking(move || write_atomic(&path, value.as_bytes(), true)).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.entry_path(key)?;
        let ttl = self.ttl;
        blocking(move || {
            // Expired entries are left for the next writer to reclaim.
            if is_expired(&path, ttl)? {
                return Ok(None);
            }
            match std::fs::read_to_string(&path) {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let path = self.entry_path(key)?;
        let ttl = self.ttl;
        blocking(move || {
            if is_expired(&path, ttl)? {
                return Ok(false);
            }
            remove_if_present(&path)
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, value: String) -> StorageResult<bool> {
        let path = self.entry_path(key)?;
        let ttl = self.ttl;
        let key = key.to_string();
        blocking(move || {
            if create_entry(&path, &value)? {
                return Ok(true);
            }
            if !is_expired(&path, ttl)? {
                return Ok(false);
            }
            debug!(key = %key, "reclaiming expired session entry");
            reclaim(&path, &value, ttl)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_put_if_absent_is_exclusive() {
        let cache = MemorySessionCache::new(Duration::from_secs(60), 100);
        assert!(cache.put_if_absent("k", "k".into()).await.unwrap());
        assert!(!cache.put_if_absent("k", "other".into()).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("k"));

        assert!(cache.remove("k").await.unwrap());
        assert!(cache.put_if_absent("k", "k".into()).await.unwrap());
    }

    #[tokio::test]
    async fn memory_entries_expire() {
        let cache = MemorySessionCache::new(Duration::from_millis(50), 100);
        cache.put("k", "v".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.put_if_absent("k", "v2".into()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory_concurrent_inserts_have_one_winner() {
        let cache = std::sync::Arc::new(MemorySessionCache::new(Duration::from_secs(60), 100));
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = std::sync::Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.put_if_absent("hot", format!("{i}")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn file_put_if_absent_is_exclusive_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileSessionCache::open(dir.path(), Duration::from_secs(60)).unwrap();
        let b = FileSessionCache::open(dir.path(), Duration::from_secs(60)).unwrap();

        assert!(a.put_if_absent("plugins/foo.pkg", "x".into()).await.unwrap());
        assert!(!b.put_if_absent("plugins/foo.pkg", "x".into()).await.unwrap());
        assert_eq!(
            b.get("plugins/foo.pkg").await.unwrap().as_deref(),
            Some("x")
        );

        assert!(a.remove("plugins/foo.pkg").await.unwrap());
        assert!(b.put_if_absent("plugins/foo.pkg", "y".into()).await.unwrap());
    }

    #[tokio::test]
    async fn file_expired_entry_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSessionCache::open(dir.path(), Duration::from_millis(50)).unwrap();
        assert!(cache.put_if_absent("k", "old".into()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.put_if_absent("k", "new".into()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn file_expired_entry_has_one_reclaimer() {
        let dir = tempfile::tempdir().unwrap();
        let ttl = Duration::from_millis(100);
        let seed = FileSessionCache::open(dir.path(), ttl).unwrap();

        for round in 0..5 {
            // Leave an entry behind as a crashed holder would.
            assert!(seed.put_if_absent("plugins/foo.pkg", "stale".into()).await.unwrap());
            tokio::time::sleep(Duration::from_millis(250)).await;

            let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(16));
            let mut handles = Vec::new();
            for i in 0..16 {
                let cache = FileSessionCache::open(dir.path(), ttl).unwrap();
                let barrier = std::sync::Arc::clone(&barrier);
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    cache.put_if_absent("plugins/foo.pkg", format!("{i}")).await.unwrap()
                }));
            }
            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "round {round}");

            // Only the fresh entry is left: no marker, no tombstone.
            let names: Vec<_> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(names.len(), 1, "round {round}: {names:?}");

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    #[tokio::test]
    async fn file_live_reclaim_marker_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSessionCache::open(dir.path(), Duration::from_millis(100)).unwrap();
        assert!(cache.put_if_absent("k", "old".into()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;

        let entry = cache.entry_path("k").unwrap();
        std::fs::write(entry.with_extension(RECLAIM_EXTENSION), b"").unwrap();
        assert!(!cache.put_if_absent("k", "new".into()).await.unwrap());

        // Once the marker itself is stale it is cleared and the next writer wins.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!cache.put_if_absent("k", "new".into()).await.unwrap());
        assert!(cache.put_if_absent("k", "new".into()).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn file_expired_entry_is_not_released_by_old_holder() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSessionCache::open(dir.path(), Duration::from_millis(50)).unwrap();
        assert!(cache.put_if_absent("k", "k".into()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!cache.remove("k").await.unwrap());
        assert!(cache.put_if_absent("k", "k".into()).await.unwrap());
    }

    #[test]
    fn file_rejects_oversized_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSessionCache::open(dir.path(), Duration::from_secs(1)).unwrap();
        assert!(cache.entry_path(&"k".repeat(MAX_FILE_KEY_LEN + 1)).is_err());
        assert!(cache.entry_path("").is_err());
    }
}
