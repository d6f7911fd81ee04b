//! Loader service: the plugin lifecycle façade.
//!
//! Per plugin id the lifecycle is `unknown -> disabled -> enabled ->
//! disabled -> removed`. Records live in the shared [`InfoStore`]; live
//! instances and their loaders are strictly per-process.
//!
//! Locking, outermost first:
//!
//! - the reconciliation gate, shared with the scanner, serialises scans,
//!   uploads, refreshes and removals within this process;
//! - a per-id transition mutex serialises enable/disable/remove of one id
//!   within this process;
//! - the [`EphemeralLock`] on the record's storage key serialises the same
//!   mutations across processes.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_plugin_api::{PluginDescriptor, PluginEntryPoint};
use keel_storage::{BlobStore, SessionCache};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::read_metadata_from_reader;
use crate::cache::{MAX_PACKAGE_SIZE, PackageCache};
use crate::error::{PluginError, PluginResult};
use crate::info::InfoStore;
use crate::isolation::{HostNamespace, HostResolver, IsolatedLoader, LoaderContext, SharedPatterns};
use crate::lock::EphemeralLock;
use crate::manager::LoaderManager;
use crate::model::PluginRecord;
use crate::plugin::PluginId;
use crate::runtime::RuntimeRegistry;
use crate::scanner::{RefreshOutcome, RepositoryScanner, ScanReport};
use crate::task::blocking;

/// Repository directory uploaded packages are stored under.
pub const UPLOAD_PREFIX: &str = "plugins";

/// A live, configured plugin instance.
pub struct ActivePlugin {
    record: PluginRecord,
    entry_point: Arc<dyn PluginEntryPoint>,
    descriptor: PluginDescriptor,
    loader: Arc<IsolatedLoader>,
    activated_at: DateTime<Utc>,
    instance_id: Uuid,
}

impl ActivePlugin {
    /// The plugin id.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        self.record.id()
    }

    /// The record as of activation (enabled).
    #[must_use]
    pub fn record(&self) -> &PluginRecord {
        &self.record
    }

    /// The instantiated entry point.
    #[must_use]
    pub fn entry_point(&self) -> &Arc<dyn PluginEntryPoint> {
        &self.entry_point
    }

    /// What `configure()` returned.
    #[must_use]
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// The loader the instance was created through.
    #[must_use]
    pub fn loader(&self) -> &Arc<IsolatedLoader> {
        &self.loader
    }

    /// When the instance was activated.
    #[must_use]
    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    /// Unique id of this activation.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl std::fmt::Debug for ActivePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivePlugin")
            .field("id", self.id())
            .field("instance_id", &self.instance_id)
            .field("activated_at", &self.activated_at)
            .field("tools", &self.descriptor.tools.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`LoaderService`].
pub struct LoaderServiceBuilder {
    repository: Arc<dyn BlobStore>,
    info: Arc<dyn InfoStore>,
    cache: Arc<PackageCache>,
    lock_cache: Arc<dyn SessionCache>,
    host: Arc<dyn HostResolver>,
    shared: SharedPatterns,
    runtimes: RuntimeRegistry,
}

impl LoaderServiceBuilder {
    /// Replace the host namespace (defaults to the contract symbols only).
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn HostResolver>) -> Self {
        self.host = host;
        self
    }

    /// Replace the shared patterns (defaults to [`SharedPatterns::new`]).
    #[must_use]
    pub fn with_shared_patterns(mut self, shared: SharedPatterns) -> Self {
        self.shared = shared;
        self
    }

    /// Replace the module runtimes (defaults to WASM plus declarative).
    #[must_use]
    pub fn with_runtimes(mut self, runtimes: RuntimeRegistry) -> Self {
        self.runtimes = runtimes;
        self
    }

    /// Assemble the service.
    #[must_use]
    pub fn build(self) -> LoaderService {
        let lock = EphemeralLock::new(self.lock_cache);
        let context = LoaderContext::new(self.host, self.shared, self.runtimes);
        let scanner = RepositoryScanner::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.info),
            Arc::clone(&self.cache),
            lock.clone(),
        );
        LoaderService {
            repository: self.repository,
            info: self.info,
            cache: Arc::clone(&self.cache),
            lock,
            scanner,
            loaders: LoaderManager::new(self.cache, context),
            active: DashMap::new(),
            transitions: DashMap::new(),
        }
    }
}

/// Uploads, enables, disables, refreshes and removes plugins.
pub struct LoaderService {
    repository: Arc<dyn BlobStore>,
    info: Arc<dyn InfoStore>,
    cache: Arc<PackageCache>,
    lock: EphemeralLock,
    scanner: RepositoryScanner,
    loaders: LoaderManager,
    active: DashMap<PluginId, Arc<ActivePlugin>>,
    transitions: DashMap<PluginId, Arc<Mutex<()>>>,
}

impl LoaderService {
    /// Start building a service over its four collaborators.
    #[must_use]
    pub fn builder(
        repository: Arc<dyn BlobStore>,
        info: Arc<dyn InfoStore>,
        cache: Arc<PackageCache>,
        lock_cache: Arc<dyn SessionCache>,
    ) -> LoaderServiceBuilder {
        LoaderServiceBuilder {
            repository,
            info,
            cache,
            lock_cache,
            host: Arc::new(HostNamespace::new()),
            shared: SharedPatterns::new(),
            runtimes: RuntimeRegistry::default(),
        }
    }

    /// The scanner sharing this service's gate.
    #[must_use]
    pub fn scanner(&self) -> &RepositoryScanner {
        &self.scanner
    }

    /// The per-process loader cache.
    #[must_use]
    pub fn loaders(&self) -> &LoaderManager {
        &self.loaders
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// Every known plugin.
    ///
    /// # Errors
    ///
    /// Returns the info store's error.
    pub async fn plugin_info(&self) -> PluginResult<Vec<PluginRecord>> {
        self.info.list().await
    }

    /// The record for `id`.
    ///
    /// # Errors
    ///
    /// Returns the info store's error.
    pub async fn plugin_info_for(&self, id: &PluginId) -> PluginResult<Option<PluginRecord>> {
        self.info.get(id).await
    }

    /// Records flagged enabled.
    ///
    /// # Errors
    ///
    /// Returns the info store's error.
    pub async fn enabled_plugin_info(&self) -> PluginResult<Vec<PluginRecord>> {
        let mut records = self.info.list().await?;
        records.retain(|r| r.enabled);
        Ok(records)
    }

    /// Live instances of this process, sorted by id.
    #[must_use]
    pub fn active_plugins(&self) -> Vec<Arc<ActivePlugin>> {
        let mut active: Vec<_> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        active.sort_by(|a, b| a.id().cmp(b.id()));
        active
    }

    /// The live instance for `id`.
    #[must_use]
    pub fn active_plugin(&self, id: &PluginId) -> Option<Arc<ActivePlugin>> {
        self.active.get(id).map(|e| Arc::clone(e.value()))
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    /// Register a new package from a byte stream.
    ///
    /// The package is cached under its derived filename, stored in the
    /// repository at `plugins/<filename>`, and recorded disabled. With
    /// `enabled` it is then enabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyExists`] if the id is already recorded
    /// or the filename is already cached, [`PluginError::LockUnavailable`]
    /// if another holder has the storage key, and archive or storage errors
    /// otherwise. Nothing is left behind on failure.
    pub async fn upload<R>(&self, reader: R, enabled: bool) -> PluginResult<PluginRecord>
    where
        R: Read + Send + 'static,
    {
        let record = {
            let _gate = self.scanner.gate().lock().await;

            let bytes = Arc::new(blocking(move || read_bounded(reader, MAX_PACKAGE_SIZE)).await?);
            let header = Arc::clone(&bytes);
            let metadata = blocking(move || read_metadata_from_reader(header.as_slice())).await?;
            let filename = metadata.filename()?;
            let storage_key = format!("{UPLOAD_PREFIX}/{filename}");

            if self.info.get(&metadata.id).await?.is_some() {
                return Err(PluginError::AlreadyExists(metadata.id.to_string()));
            }

            self.lock
                .lock_or_fail(&storage_key, || {
                    self.register_upload(Arc::clone(&bytes), &filename, &storage_key)
                })
                .await?
        };

        if enabled {
            let active = self.enable(record.id()).await?;
            return Ok(active.record().clone());
        }
        Ok(record)
    }

    async fn register_upload(
        &self,
        bytes: Arc<Vec<u8>>,
        filename: &str,
        storage_key: &str,
    ) -> PluginResult<PluginRecord> {
        let cache = Arc::clone(&self.cache);
        let name = filename.to_string();
        let data = Arc::clone(&bytes);
        let cached = blocking(move || cache.save(&name, data.as_slice(), false)).await?;

        let stored = async {
            self.repository
                .upsert(storage_key, bytes.as_ref().clone())
                .await?;
            let record = PluginRecord::new(cached.metadata.clone(), storage_key);
            self.info.save(&record).await?;
            Ok::<_, PluginError>(record)
        }
        .await;

        match stored {
            Ok(record) => {
                info!(
                    plugin_id = %record.id(),
                    storage_key = %storage_key,
                    digest = %cached.digest,
                    size = cached.size,
                    "uploaded plugin"
                );
                Ok(record)
            },
            Err(e) => {
                let cache = Arc::clone(&self.cache);
                let name = cached.filename.clone();
                if let Err(cleanup) = blocking(move || cache.delete(&name, true)).await {
                    warn!(filename = %cached.filename, error = %cleanup, "failed to discard cached upload");
                }
                Err(e)
            },
        }
    }

    /// Activate `id`, or return its live instance if already active.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown ids,
    /// [`PluginError::LockUnavailable`] under contention,
    /// [`PluginError::SymbolNotFound`] or [`PluginError::InvalidEntryPoint`]
    /// for structurally invalid packages, and [`PluginError::EntryPoint`] if
    /// the plugin's `configure()` fails. The plugin stays disabled and no
    /// loader is kept on failure.
    pub async fn enable(&self, id: &PluginId) -> PluginResult<Arc<ActivePlugin>> {
        let transition = self.transition(id);
        let _transition = transition.lock().await;

        if let Some(active) = self.active_plugin(id) {
            debug!(plugin_id = %id, "plugin already enabled");
            return Ok(active);
        }

        let record = self
            .info
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        let key = record.storage_key.clone();
        self.lock
            .lock_or_fail(&key, || async {
                let activated = self.activate(record).await;
                if activated.is_err() {
                    self.loaders.close(id);
                }
                activated
            })
            .await
    }

    async fn activate(&self, mut record: PluginRecord) -> PluginResult<Arc<ActivePlugin>> {
        let id = record.id().clone();
        let repository = Arc::clone(&self.repository);
        let storage_key = record.storage_key.clone();
        let loader = self
            .loaders
            .get(&record.metadata, |id| async move {
                repository
                    .read(&storage_key)
                    .await?
                    .ok_or(PluginError::NotFound(id))
            })
            .await?;

        let entry_loader = Arc::clone(&loader);
        let entry_point = blocking(move || entry_loader.load_entry_point()?.instantiate()).await?;

        let descriptor = entry_point
            .configure()
            .await
            .map_err(|e| PluginError::EntryPoint {
                plugin_id: id.clone(),
                message: e.to_string(),
            })?;
        if descriptor.id != id.as_str() {
            warn!(plugin_id = %id, descriptor_id = %descriptor.id, "descriptor id differs from package id");
        }

        record.enabled = true;
        if let Err(e) = self.info.save(&record).await {
            shutdown_instance(&id, entry_point.as_ref()).await;
            return Err(e);
        }

        let active = Arc::new(ActivePlugin {
            record,
            entry_point,
            descriptor,
            loader,
            activated_at: Utc::now(),
            instance_id: Uuid::new_v4(),
        });
        self.active.insert(id.clone(), Arc::clone(&active));
        info!(
            plugin_id = %id,
            instance_id = %active.instance_id,
            tools = active.descriptor.tools.len(),
            "enabled plugin"
        );
        Ok(active)
    }

    /// Deactivate `id` and flag it disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown ids,
    /// [`PluginError::LockUnavailable`] under contention, and storage errors.
    pub async fn disable(&self, id: &PluginId) -> PluginResult<PluginRecord> {
        let transition = self.transition(id);
        let _transition = transition.lock().await;

        let mut record = self
            .info
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        let key = record.storage_key.clone();
        self.lock
            .lock_or_fail(&key, || async {
                self.deactivate_locked(id).await;
                if record.enabled {
                    record.enabled = false;
                    self.info.save(&record).await?;
                }
                info!(plugin_id = %id, "disabled plugin");
                Ok(record)
            })
            .await
    }

    /// Reconcile a single repository path.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::LockUnavailable`] under contention and
    /// archive or storage errors.
    pub async fn refresh(&self, path: &str) -> PluginResult<RefreshOutcome> {
        let _gate = self.scanner.gate().lock().await;
        let outcome = self.scanner.refresh_locked(path).await?;
        if let RefreshOutcome::Removed(record) = &outcome {
            self.deactivate(record.id()).await;
        }
        Ok(outcome)
    }

    /// Remove `id` everywhere: live instance, loader, record, cached package
    /// and remote artifact.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown ids,
    /// [`PluginError::LockUnavailable`] under contention, and storage errors.
    pub async fn remove(&self, id: &PluginId) -> PluginResult<PluginRecord> {
        let _gate = self.scanner.gate().lock().await;
        let transition = self.transition(id);
        let _transition = transition.lock().await;

        let record = self
            .info
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        let key = record.storage_key.clone();
        self.lock
            .lock_or_fail(&key, || async {
                self.deactivate_locked(id).await;
                self.info.delete(id).await?;
                if let Ok(filename) = record.metadata.filename() {
                    let cache = Arc::clone(&self.cache);
                    blocking(move || cache.delete(&filename, true)).await?;
                }
                self.repository.delete(&record.storage_key).await?;
                info!(plugin_id = %id, storage_key = %record.storage_key, "removed plugin");
                Ok(record)
            })
            .await
    }

    /// Reconcile with the repository, then deactivate plugins whose record
    /// was removed.
    ///
    /// # Errors
    ///
    /// See [`RepositoryScanner::scan`].
    pub async fn scan(&self) -> PluginResult<ScanReport> {
        let _gate = self.scanner.gate().lock().await;
        let report = self.scanner.scan_locked().await?;
        for record in &report.removed {
            self.deactivate(record.id()).await;
        }
        Ok(report)
    }

    /// Enable every record flagged enabled. Failures are logged and the
    /// remaining plugins still start.
    ///
    /// # Errors
    ///
    /// Returns the info store's error if records cannot be listed.
    pub async fn restore_enabled(&self) -> PluginResult<Vec<Arc<ActivePlugin>>> {
        let mut restored = Vec::new();
        for record in self.enabled_plugin_info().await? {
            match self.enable(record.id()).await {
                Ok(active) => restored.push(active),
                Err(e) => error!(plugin_id = %record.id(), error = %e, "failed to restore plugin"),
            }
        }
        info!(count = restored.len(), "restored enabled plugins");
        Ok(restored)
    }

    /// Shut down every live instance and close every loader. Records keep
    /// their enabled flag so the next start restores them.
    pub async fn shutdown(&self) {
        let ids: Vec<PluginId> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.deactivate(id).await;
        }
        self.loaders.close_all();
        info!(count = ids.len(), "loader service shut down");
    }

    /// Run [`LoaderService::scan`] every `interval` until `cancel` fires.
    pub fn spawn_periodic_scan(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan().await {
                            warn!(error = %e, "periodic scan failed");
                        }
                    }
                }
            }
            debug!("periodic scan stopped");
        })
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn transition(&self, id: &PluginId) -> Arc<Mutex<()>> {
        Arc::clone(&self.transitions.entry(id.clone()).or_default())
    }

    async fn deactivate(&self, id: &PluginId) {
        let transition = self.transition(id);
        let _transition = transition.lock().await;
        self.deactivate_locked(id).await;
    }

    /// Drop the live instance and loader of `id`, if any.
    async fn deactivate_locked(&self, id: &PluginId) {
        if let Some((_, active)) = self.active.remove(id) {
            shutdown_instance(id, active.entry_point.as_ref()).await;
            debug!(plugin_id = %id, instance_id = %active.instance_id, "deactivated instance");
        }
        self.loaders.close(id);
    }
}

impl std::fmt::Debug for LoaderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderService")
            .field("cache", &self.cache.dir())
            .field("active", &self.active.len())
            .field("loaders", &self.loaders)
            .finish_non_exhaustive()
    }
}

async fn shutdown_instance(id: &PluginId, entry_point: &dyn PluginEntryPoint) {
    if let Err(e) = entry_point.shutdown().await {
        warn!(plugin_id = %id, error = %e, "plugin shutdown failed");
    }
}

fn read_bounded<R: Read>(reader: R, limit: u64) -> PluginResult<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    let size = bytes.len() as u64;
    if size > limit {
        return Err(PluginError::PackageTooLarge { size, limit });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_storage::{MemoryBlobStore, MemoryKvStore, MemorySessionCache};

    use super::*;
    use crate::archive::METADATA_PATH;
    use crate::info::KvInfoStore;
    use crate::test_support::{ENTRY_POINT_MODULE, metadata_json, package_bytes};

    struct Fixture {
        _dir: tempfile::TempDir,
        repository: Arc<MemoryBlobStore>,
        locks: Arc<MemorySessionCache>,
        service: LoaderService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MemoryBlobStore::new());
        let info = Arc::new(KvInfoStore::new(Arc::new(MemoryKvStore::new()), "plugins").unwrap());
        let cache = Arc::new(PackageCache::open(dir.path()).unwrap());
        let locks = Arc::new(MemorySessionCache::new(Duration::from_secs(60), 1_000));
        let service =
            LoaderService::builder(repository.clone(), info, cache, locks.clone()).build();
        Fixture {
            _dir: dir,
            repository,
            locks,
            service,
        }
    }

    fn package(id: &str, main: &str) -> Vec<u8> {
        let meta = metadata_json(id, Some("1.0"), "com.example.Main");
        package_bytes(&[
            (METADATA_PATH, meta.as_bytes()),
            ("modules/com/example/Main.json", main.as_bytes()),
        ])
    }

    #[tokio::test]
    async fn upload_records_disabled_and_stores_remotely() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), false)
            .await
            .unwrap();
        assert!(!record.enabled);
        assert_eq!(record.storage_key, "plugins/demo-1.0.pkg");
        assert!(fx.repository.exists("plugins/demo-1.0.pkg").await.unwrap());
        assert!(fx.service.active_plugins().is_empty());

        let again = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), false)
            .await;
        assert!(matches!(again, Err(PluginError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn upload_with_enable_activates() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), true)
            .await
            .unwrap();
        assert!(record.enabled);
        assert!(fx.service.active_plugin(record.id()).is_some());
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), false)
            .await
            .unwrap();
        let first = fx.service.enable(record.id()).await.unwrap();
        let second = fx.service.enable(record.id()).await.unwrap();
        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(fx.service.enabled_plugin_info().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let fx = fixture();
        let id = PluginId::from_static("ghost");
        assert!(matches!(fx.service.enable(&id).await, Err(PluginError::NotFound(_))));
        assert!(matches!(fx.service.disable(&id).await, Err(PluginError::NotFound(_))));
        assert!(matches!(fx.service.remove(&id).await, Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_entry_point_leaves_plugin_disabled() {
        let fx = fixture();
        let not_an_entry_point = r#"{"implements": []}"#;
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", not_an_entry_point)), false)
            .await
            .unwrap();

        let err = fx.service.enable(record.id()).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidEntryPoint { .. }));
        assert!(fx.service.active_plugin(record.id()).is_none());
        assert!(fx.service.loaders().is_empty());
        let stored = fx.service.plugin_info_for(record.id()).await.unwrap().unwrap();
        assert!(!stored.enabled);
    }

    #[tokio::test]
    async fn enable_under_contention_fails_fast() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), false)
            .await
            .unwrap();
        fx.locks
            .put_if_absent(&record.storage_key, record.storage_key.clone())
            .await
            .unwrap();
        assert!(matches!(
            fx.service.enable(record.id()).await,
            Err(PluginError::LockUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn remove_deletes_everything() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), true)
            .await
            .unwrap();

        fx.service.remove(record.id()).await.unwrap();
        assert!(fx.service.active_plugin(record.id()).is_none());
        assert!(fx.service.plugin_info().await.unwrap().is_empty());
        assert!(!fx.repository.exists(&record.storage_key).await.unwrap());
        assert!(fx.service.loaders().is_empty());
    }

    #[tokio::test]
    async fn scan_deactivates_removed_plugins() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), true)
            .await
            .unwrap();
        fx.repository.delete(&record.storage_key).await.unwrap();

        let report = fx.service.scan().await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(fx.service.active_plugin(record.id()).is_none());
        assert!(fx.service.loaders().is_empty());
    }

    #[tokio::test]
    async fn shutdown_keeps_enabled_flag_for_restore() {
        let fx = fixture();
        let record = fx
            .service
            .upload(std::io::Cursor::new(package("demo", ENTRY_POINT_MODULE)), true)
            .await
            .unwrap();
        fx.service.shutdown().await;
        assert!(fx.service.active_plugins().is_empty());

        let restored = fx.service.restore_enabled().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id(), record.id());
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let reader = std::io::repeat(0).take(4_096);
        assert!(matches!(
            read_bounded(reader, 1_024),
            Err(PluginError::PackageTooLarge { size: 1_025, limit: 1_024 })
        ));
        assert_eq!(read_bounded(&b"small"[..], 1_024).unwrap(), b"small");
    }
}
