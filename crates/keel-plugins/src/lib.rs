//! Plugin packaging, isolation and lifecycle management for the keel host.
//!
//! A long-running host discovers plugin packages in a shared remote
//! repository, caches them locally, and activates each one inside its own
//! symbol namespace without restarting. Several hosts may share one
//! repository; they converge on the same set of known plugins through a
//! lock-guarded reconciliation scan.
//!
//! Components, leaves first:
//!
//! - [`archive`]: reads `META-INF/plugin.json` and the module table from
//!   `.pkg` packages, including packages nested inside other packages
//! - [`cache`]: the local package cache with atomic create/replace
//! - [`isolation`]: per-plugin [`IsolatedLoader`]s that resolve shared
//!   contract names through the host and everything else from the package
//! - [`runtime`]: module runtimes that define symbols from `.wasm` and
//!   `.json` code units
//! - [`manager`]: the per-process get-or-create cache of loaders
//! - [`info`]: the durable [`PluginRecord`] store
//! - [`lock`]: the TTL-backed [`EphemeralLock`]
//! - [`scanner`]: repository reconciliation
//! - [`service`]: the [`LoaderService`] façade
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use keel_plugins::{KvInfoStore, LoaderService, PackageCache, PluginId};
//! use keel_storage::{FileBlobStore, FileKvStore, FileSessionCache};
//!
//! let service = LoaderService::builder(
//!     Arc::new(FileBlobStore::open("./data/storage")?),
//!     Arc::new(KvInfoStore::new(Arc::new(FileKvStore::open("./data/datastore")?), "plugins")?),
//!     Arc::new(PackageCache::open("./data/plugin-cache")?),
//!     Arc::new(FileSessionCache::open("./data/locks", Duration::from_secs(300))?),
//! )
//! .build();
//!
//! service.scan().await?;
//! let active = service.enable(&PluginId::new("sysinfo")?).await?;
//! println!("{} tools", active.descriptor().tools.len());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod archive;
pub mod cache;
pub mod error;
pub mod info;
pub mod isolation;
pub mod lock;
pub mod manager;
pub mod model;
pub mod plugin;
pub mod runtime;
pub mod scanner;
pub mod service;
mod task;

pub use archive::{PackageLocator, read_metadata, read_metadata_from_reader};
pub use cache::PackageCache;
pub use error::{PluginError, PluginResult};
pub use info::{InfoStore, KvInfoStore, ReadOnlyInfoStore};
pub use isolation::{
    EntryPointHandle, HostNamespace, HostResolver, IsolatedLoader, LoaderContext,
    SharedPatterns, Symbol, SymbolOrigin,
};
pub use lock::EphemeralLock;
pub use manager::LoaderManager;
pub use model::{CachedPackage, PluginMetadata, PluginRecord};
pub use plugin::PluginId;
pub use runtime::{DeclarativeRuntime, ModuleRuntime, RuntimeRegistry, WasmRuntime};
pub use scanner::{RefreshOutcome, RepositoryScanner, ScanReport};
pub use service::{ActivePlugin, LoaderService, LoaderServiceBuilder};
