//! Per-process cache of isolated loaders.
//!
//! The manager owns every live [`IsolatedLoader`] of the process, keyed by
//! plugin id. Loaders are materialised lazily: from the local package cache
//! when the package is already there, otherwise through a caller-supplied
//! fetch (usually a read from the remote repository) that is persisted to
//! the cache first.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::archive::PackageLocator;
use crate::cache::PackageCache;
use crate::error::{PluginError, PluginResult};
use crate::isolation::{IsolatedLoader, LoaderContext};
use crate::model::PluginMetadata;
use crate::plugin::PluginId;
use crate::task::blocking;

type LoaderCell = Arc<OnceCell<Arc<IsolatedLoader>>>;

/// Get-or-create cache of [`IsolatedLoader`]s.
///
/// Creation is single-flight per id: concurrent callers for the same id
/// await the same initialisation and all receive the same loader. A failed
/// initialisation leaves nothing behind, so the next caller starts over.
pub struct LoaderManager {
    cache: Arc<PackageCache>,
    context: LoaderContext,
    loaders: DashMap<PluginId, LoaderCell>,
}

impl LoaderManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(cache: Arc<PackageCache>, context: LoaderContext) -> Self {
        Self {
            cache,
            context,
            loaders: DashMap::new(),
        }
    }

    /// The local package cache loaders are built from.
    #[must_use]
    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    /// The loader for `metadata.id`, creating it if needed.
    ///
    /// `fetch` is only called when the package is not in the local cache.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, cache errors, or the archive reader's errors.
    /// A package whose embedded id differs from `metadata.id` is rejected as
    /// [`PluginError::CorruptArchive`].
    pub async fn get<F, Fut>(
        &self,
        metadata: &PluginMetadata,
        fetch: F,
    ) -> PluginResult<Arc<IsolatedLoader>>
    where
        F: FnOnce(PluginId) -> Fut,
        Fut: Future<Output = PluginResult<Vec<u8>>>,
    {
        let id = metadata.id.clone();
        let cell: LoaderCell = Arc::clone(&self.loaders.entry(id.clone()).or_default());

        let result = cell
            .get_or_try_init(|| self.materialize(metadata, fetch))
            .await
            .map(Arc::clone);

        if result.is_err() {
            self.loaders
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &cell) && !current.initialized());
        }
        result
    }

    async fn materialize<F, Fut>(
        &self,
        metadata: &PluginMetadata,
        fetch: F,
    ) -> PluginResult<Arc<IsolatedLoader>>
    where
        F: FnOnce(PluginId) -> Fut,
        Fut: Future<Output = PluginResult<Vec<u8>>>,
    {
        let filename = metadata.filename()?;

        let cache = Arc::clone(&self.cache);
        let name = filename.clone();
        let cached = blocking(move || cache.contains(&name)).await?;
        if !cached {
            debug!(plugin_id = %metadata.id, filename = %filename, "package not cached, fetching");
            let bytes = fetch(metadata.id.clone()).await?;
            let cache = Arc::clone(&self.cache);
            let name = filename.clone();
            match blocking(move || cache.save(&name, bytes.as_slice(), false)).await {
                // Another writer persisted the same package first.
                Ok(_) | Err(PluginError::AlreadyExists(_)) => {},
                Err(e) => return Err(e),
            }
        }

        let path = self.cache.path(&filename)?;
        let context = self.context.clone();
        let loader =
            blocking(move || IsolatedLoader::open(PackageLocator::path(path), context)).await?;

        if loader.plugin_id() != &metadata.id {
            return Err(PluginError::CorruptArchive {
                locator: loader.locator().to_string(),
                message: format!(
                    "package declares id {} but {} was expected",
                    loader.plugin_id(),
                    metadata.id
                ),
            });
        }

        info!(plugin_id = %metadata.id, filename = %filename, "created isolated loader");
        Ok(Arc::new(loader))
    }

    /// The existing loader for `id`, if one is fully created.
    #[must_use]
    pub fn loader(&self, id: &PluginId) -> Option<Arc<IsolatedLoader>> {
        self.loaders
            .get(id)
            .and_then(|cell| cell.get().map(Arc::clone))
    }

    /// Whether a loader for `id` exists.
    #[must_use]
    pub fn contains(&self, id: &PluginId) -> bool {
        self.loader(id).is_some()
    }

    /// Number of created loaders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaders.iter().filter(|e| e.value().initialized()).count()
    }

    /// Whether no loader exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget the loader for `id`. Returns whether one existed.
    pub fn close(&self, id: &PluginId) -> bool {
        let Some((_, cell)) = self.loaders.remove(id) else {
            return false;
        };
        match cell.get() {
            Some(loader) => {
                loader.close();
                true
            },
            None => false,
        }
    }

    /// Close every loader. Used at host shutdown.
    pub fn close_all(&self) {
        let ids: Vec<PluginId> = self.loaders.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for id in ids {
            if self.close(&id) {
                closed = closed.saturating_add(1);
            }
        }
        info!(count = closed, "closed all isolated loaders");
    }
}

impl std::fmt::Debug for LoaderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderManager")
            .field("cache", &self.cache.dir())
            .field("loaders", &self.len())
            .finish_non_exhaustive()
    }
}
