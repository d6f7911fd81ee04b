//! Repository scanner.
//!
//! Reconciles the remote repository's listing with the info store:
//!
//! 1. paths present remotely but unknown are downloaded, cached and
//!    recorded as disabled plugins;
//! 2. known storage keys that vanished remotely lose their record;
//! 3. cached packages no remaining record refers to are pruned.
//!
//! Every per-path action runs under the [`EphemeralLock`] for that path and
//! is skipped, not awaited, when another holder has it. The next scan
//! retries. Per-path failures are logged and reported, never raised.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use keel_storage::BlobStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive::read_metadata_from_reader;
use crate::cache::PackageCache;
use crate::error::PluginResult;
use crate::info::InfoStore;
use crate::lock::EphemeralLock;
use crate::model::{PACKAGE_EXTENSION, PluginRecord};
use crate::plugin::PluginId;
use crate::task::blocking;

/// What one scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Newly recorded plugins.
    pub added: Vec<PluginId>,
    /// Records deleted because their remote artifact is gone.
    pub removed: Vec<PluginRecord>,
    /// Cache files deleted by the sweep.
    pub pruned: Vec<String>,
    /// Storage keys left alone: locked elsewhere or owned by another record.
    pub skipped: Vec<String>,
    /// Storage keys whose reconciliation failed, with the error.
    pub failed: Vec<(String, String)>,
}

impl ScanReport {
    /// Whether the scan changed no record.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Result of reconciling a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The path was unknown and is now recorded.
    Added(PluginId),
    /// The path was gone remotely and its record was deleted.
    Removed(PluginRecord),
    /// Nothing to do.
    Unchanged,
}

enum AddOutcome {
    Added(PluginId),
    Skipped,
}

/// Reconciles one process's view with the shared repository.
pub struct RepositoryScanner {
    repository: Arc<dyn BlobStore>,
    info: Arc<dyn InfoStore>,
    cache: Arc<PackageCache>,
    lock: EphemeralLock,
    gate: Arc<Mutex<()>>,
}

impl RepositoryScanner {
    /// Create a scanner with its own reconciliation gate.
    #[must_use]
    pub fn new(
        repository: Arc<dyn BlobStore>,
        info: Arc<dyn InfoStore>,
        cache: Arc<PackageCache>,
        lock: EphemeralLock,
    ) -> Self {
        Self {
            repository,
            info,
            cache,
            lock,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// The in-process gate that serialises scans with other mutations of the
    /// local cache.
    pub(crate) fn gate(&self) -> &Arc<Mutex<()>> {
        &self.gate
    }

    /// Run one reconciliation pass. Concurrent calls queue up.
    ///
    /// # Errors
    ///
    /// Returns an error only if the info store or the repository cannot be
    /// listed; nothing is changed in that case.
    pub async fn scan(&self) -> PluginResult<ScanReport> {
        let _gate = self.gate.lock().await;
        self.scan_locked().await
    }

    /// [`RepositoryScanner::scan`] for callers already holding the gate.
    pub(crate) async fn scan_locked(&self) -> PluginResult<ScanReport> {
        let known: BTreeMap<String, PluginRecord> = self
            .info
            .list()
            .await?
            .into_iter()
            .map(|r| (r.storage_key.clone(), r))
            .collect();
        let remote = self.remote_packages().await?;

        let mut report = ScanReport::default();

        for path in remote.iter().filter(|p| !known.contains_key(*p)) {
            let outcome = self
                .lock
                .try_lock(path, || self.add(path), || async { Ok(AddOutcome::Skipped) })
                .await;
            match outcome {
                Ok(AddOutcome::Added(id)) => report.added.push(id),
                Ok(AddOutcome::Skipped) => report.skipped.push(path.clone()),
                Err(e) => {
                    warn!(storage_key = %path, error = %e, "failed to add plugin from repository");
                    report.failed.push((path.clone(), e.to_string()));
                },
            }
        }

        for (key, record) in known.iter().filter(|(k, _)| !remote.contains(*k)) {
            let outcome = self
                .lock
                .try_lock(key, || self.remove(record), || async { Ok(None) })
                .await;
            match outcome {
                Ok(Some(removed)) => report.removed.push(removed),
                Ok(None) => report.skipped.push(key.clone()),
                Err(e) => {
                    warn!(storage_key = %key, error = %e, "failed to remove plugin record");
                    report.failed.push((key.clone(), e.to_string()));
                },
            }
        }

        report.pruned = self.sweep().await;

        if report.is_unchanged() && report.pruned.is_empty() {
            debug!(remote = remote.len(), "scan found nothing to reconcile");
        } else {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                pruned = report.pruned.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "scan reconciled repository"
            );
        }
        Ok(report)
    }

    /// Reconcile a single repository path, for callers holding the gate.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PluginError::LockUnavailable`] if another holder has
    /// the path, and the archive, cache or storage error otherwise.
    pub(crate) async fn refresh_locked(&self, path: &str) -> PluginResult<RefreshOutcome> {
        let exists = self.repository.exists(path).await?;
        let record = self
            .info
            .list()
            .await?
            .into_iter()
            .find(|r| r.storage_key == path);

        match (exists, record) {
            (true, None) => {
                let outcome = self.lock.lock_or_fail(path, || self.add(path)).await?;
                Ok(match outcome {
                    AddOutcome::Added(id) => RefreshOutcome::Added(id),
                    AddOutcome::Skipped => RefreshOutcome::Unchanged,
                })
            },
            (false, Some(record)) => {
                let removed = self.lock.lock_or_fail(path, || self.remove(&record)).await?;
                Ok(removed.map_or(RefreshOutcome::Unchanged, RefreshOutcome::Removed))
            },
            _ => Ok(RefreshOutcome::Unchanged),
        }
    }

    async fn remote_packages(&self) -> PluginResult<BTreeSet<String>> {
        let paths = self.repository.list_paths(None).await?;
        Ok(paths
            .into_iter()
            .filter(|p| {
                Path::new(p)
                    .extension()
                    .is_some_and(|ext| ext == PACKAGE_EXTENSION)
            })
            .collect())
    }

    /// Download `path`, cache it and record it as a disabled plugin.
    async fn add(&self, path: &str) -> PluginResult<AddOutcome> {
        let Some(bytes) = self.repository.read(path).await? else {
            debug!(storage_key = %path, "artifact vanished before download");
            return Ok(AddOutcome::Skipped);
        };
        let bytes = Arc::new(bytes);

        let header = Arc::clone(&bytes);
        let metadata = blocking(move || read_metadata_from_reader(header.as_slice())).await?;

        if let Some(existing) = self.info.get(&metadata.id).await? {
            if existing.storage_key != path {
                warn!(
                    storage_key = %path,
                    plugin_id = %metadata.id,
                    owner = %existing.storage_key,
                    "plugin id already recorded under another storage key, skipping"
                );
            }
            return Ok(AddOutcome::Skipped);
        }

        let cache = Arc::clone(&self.cache);
        let cached = blocking(move || cache.save_derived(bytes.as_slice(), true)).await?;

        let record = PluginRecord::new(cached.metadata, path);
        self.info.save(&record).await?;
        info!(
            plugin_id = %record.id(),
            storage_key = %path,
            filename = %cached.filename,
            "recorded plugin from repository"
        );
        Ok(AddOutcome::Added(record.metadata.id))
    }

    /// Delete `record` if it still points at the same storage key.
    async fn remove(&self, record: &PluginRecord) -> PluginResult<Option<PluginRecord>> {
        let current = self.info.get(record.id()).await?;
        let Some(current) = current.filter(|r| r.storage_key == record.storage_key) else {
            return Ok(None);
        };
        self.info.delete(current.id()).await?;

        if let Ok(filename) = current.metadata.filename() {
            let cache = Arc::clone(&self.cache);
            blocking(move || cache.delete(&filename, true)).await?;
        }
        info!(
            plugin_id = %current.id(),
            storage_key = %current.storage_key,
            "removed plugin record, artifact gone"
        );
        Ok(Some(current))
    }

    /// Delete cached packages no record refers to.
    async fn sweep(&self) -> Vec<String> {
        let referenced: BTreeSet<String> = match self.info.list().await {
            Ok(records) => records
                .iter()
                .filter_map(|r| r.metadata.filename().ok())
                .collect(),
            Err(e) => {
                warn!(error = %e, "cannot list plugin records, skipping cache sweep");
                return Vec::new();
            },
        };

        let cache = Arc::clone(&self.cache);
        let swept = blocking(move || {
            let mut pruned = Vec::new();
            for filename in cache.list()?.difference(&referenced) {
                match cache.delete(filename, true) {
                    Ok(true) => pruned.push(filename.clone()),
                    Ok(false) => {},
                    Err(e) => warn!(filename = %filename, error = %e, "failed to prune cached package"),
                }
            }
            Ok(pruned)
        })
        .await;

        match swept {
            Ok(pruned) => {
                for filename in &pruned {
                    debug!(filename = %filename, "pruned orphaned cached package");
                }
                pruned
            },
            Err(e) => {
                warn!(error = %e, "cache sweep failed");
                Vec::new()
            },
        }
    }
}

impl std::fmt::Debug for RepositoryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryScanner")
            .field("cache", &self.cache.dir())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_storage::{MemoryBlobStore, MemoryKvStore, MemorySessionCache, SessionCache};

    use super::*;
    use crate::archive::METADATA_PATH;
    use crate::info::KvInfoStore;
    use crate::test_support::{ENTRY_POINT_MODULE, metadata_json, package_bytes};

    struct Fixture {
        _dir: tempfile::TempDir,
        repository: Arc<MemoryBlobStore>,
        info: Arc<KvInfoStore>,
        cache: Arc<PackageCache>,
        locks: Arc<MemorySessionCache>,
        scanner: RepositoryScanner,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MemoryBlobStore::new());
        let info = Arc::new(KvInfoStore::new(Arc::new(MemoryKvStore::new()), "plugins").unwrap());
        let cache = Arc::new(PackageCache::open(dir.path().join("cache")).unwrap());
        let locks = Arc::new(MemorySessionCache::new(Duration::from_secs(60), 1_000));
        let scanner = RepositoryScanner::new(
            repository.clone(),
            info.clone(),
            Arc::clone(&cache),
            EphemeralLock::new(locks.clone()),
        );
        Fixture {
            _dir: dir,
            repository,
            info,
            cache,
            locks,
            scanner,
        }
    }

    fn package(id: &str) -> Vec<u8> {
        let meta = metadata_json(id, None, "com.example.Main");
        package_bytes(&[
            (METADATA_PATH, meta.as_bytes()),
            ("modules/com/example/Main.json", ENTRY_POINT_MODULE.as_bytes()),
        ])
    }

    #[tokio::test]
    async fn adds_unknown_and_ignores_non_packages() {
        let fx = fixture();
        fx.repository.upsert("plugins/a.pkg", package("alpha")).await.unwrap();
        fx.repository.upsert("plugins/README.md", b"docs".to_vec()).await.unwrap();

        let report = fx.scanner.scan().await.unwrap();
        assert_eq!(report.added, vec![PluginId::from_static("alpha")]);
        assert!(report.failed.is_empty());

        let record = fx.info.get(&PluginId::from_static("alpha")).await.unwrap().unwrap();
        assert_eq!(record.storage_key, "plugins/a.pkg");
        assert!(!record.enabled);
        assert!(fx.cache.contains("alpha.pkg").unwrap());
    }

    #[tokio::test]
    async fn locked_paths_are_skipped_then_retried() {
        let fx = fixture();
        fx.repository.upsert("plugins/a.pkg", package("alpha")).await.unwrap();
        fx.locks
            .put_if_absent("plugins/a.pkg", "plugins/a.pkg".into())
            .await
            .unwrap();

        let report = fx.scanner.scan().await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.skipped, vec!["plugins/a.pkg".to_string()]);
        assert!(fx.info.list().await.unwrap().is_empty());

        fx.locks.remove("plugins/a.pkg").await.unwrap();
        let report = fx.scanner.scan().await.unwrap();
        assert_eq!(report.added.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_artifact_does_not_block_others() {
        let fx = fixture();
        fx.repository.upsert("plugins/bad.pkg", b"not a package".to_vec()).await.unwrap();
        fx.repository.upsert("plugins/good.pkg", package("good")).await.unwrap();

        let report = fx.scanner.scan().await.unwrap();
        assert_eq!(report.added, vec![PluginId::from_static("good")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "plugins/bad.pkg");
        // The lock on the failed path was released.
        assert!(fx.locks.get("plugins/bad.pkg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_under_second_key_is_skipped() {
        let fx = fixture();
        fx.repository.upsert("plugins/a.pkg", package("alpha")).await.unwrap();
        fx.scanner.scan().await.unwrap();

        fx.repository.upsert("plugins/copy.pkg", package("alpha")).await.unwrap();
        let report = fx.scanner.scan().await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.skipped, vec!["plugins/copy.pkg".to_string()]);
        let record = fx.info.get(&PluginId::from_static("alpha")).await.unwrap().unwrap();
        assert_eq!(record.storage_key, "plugins/a.pkg");
    }

    #[tokio::test]
    async fn sweep_prunes_orphans() {
        let fx = fixture();
        fx.cache.save_derived(package("stale").as_slice(), false).unwrap();

        let report = fx.scanner.scan().await.unwrap();
        assert_eq!(report.pruned, vec!["stale.pkg".to_string()]);
        assert!(fx.cache.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_adds_and_removes_single_path() {
        let fx = fixture();
        fx.repository.upsert("plugins/a.pkg", package("alpha")).await.unwrap();

        let added = fx.scanner.refresh_locked("plugins/a.pkg").await.unwrap();
        assert_eq!(added, RefreshOutcome::Added(PluginId::from_static("alpha")));
        assert_eq!(
            fx.scanner.refresh_locked("plugins/a.pkg").await.unwrap(),
            RefreshOutcome::Unchanged
        );

        fx.repository.delete("plugins/a.pkg").await.unwrap();
        let removed = fx.scanner.refresh_locked("plugins/a.pkg").await.unwrap();
        assert!(matches!(removed, RefreshOutcome::Removed(r) if r.id().as_str() == "alpha"));
        assert!(!fx.cache.contains("alpha.pkg").unwrap());
    }

    #[tokio::test]
    async fn refresh_fails_fast_when_locked() {
        let fx = fixture();
        fx.repository.upsert("plugins/a.pkg", package("alpha")).await.unwrap();
        fx.locks
            .put_if_absent("plugins/a.pkg", "plugins/a.pkg".into())
            .await
            .unwrap();
        assert!(matches!(
            fx.scanner.refresh_locked("plugins/a.pkg").await,
            Err(crate::PluginError::LockUnavailable(_))
        ));
    }
}
