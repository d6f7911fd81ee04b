//! Bridge from `keel_config::Config` to the domain types of the other crates.

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_config::{Config, LockBackend};
use keel_plugins::{
    DeclarativeRuntime, InfoStore, KvInfoStore, LoaderService, PackageCache, ReadOnlyInfoStore,
    RuntimeRegistry, SharedPatterns, WasmRuntime,
};
use keel_storage::{
    BlobStore, FileBlobStore, FileKvStore, FileSessionCache, MemorySessionCache,
    ReadOnlyBlobStore, SessionCache,
};
use keel_telemetry::{FileRotation, LogConfig, LogFormat, LogTarget};

/// Logging settings from the `[logging]` section.
pub(crate) fn to_log_config(config: &Config) -> Result<LogConfig> {
    let logging = &config.logging;
    let format = logging
        .format
        .parse::<LogFormat>()
        .context("invalid logging.format")?;
    let log = LogConfig::new(logging.level.clone())
        .with_format(format)
        .with_directives(logging.directives.iter().cloned());

    Ok(match logging.target.as_str() {
        "stdout" => log.with_target(LogTarget::Stdout),
        "stderr" => log.with_target(LogTarget::Stderr),
        "file" => {
            let rotation = logging
                .rotation
                .parse::<FileRotation>()
                .context("invalid logging.rotation")?;
            log.with_file_logging(logging.file_dir.clone(), logging.file_prefix.clone(), rotation)
                .with_max_files(logging.max_files)
        },
        other => anyhow::bail!("invalid logging.target '{other}'"),
    })
}

/// Open the shared repository, honouring `repository.read_only`.
pub(crate) fn repository(config: &Config) -> Result<Arc<dyn BlobStore>> {
    let store = FileBlobStore::open(&config.repository.root).with_context(|| {
        format!(
            "failed to open repository at {}",
            config.repository.root.display()
        )
    })?;
    let store: Arc<dyn BlobStore> = Arc::new(store);
    if config.repository.read_only {
        return Ok(Arc::new(ReadOnlyBlobStore::new(store)));
    }
    Ok(store)
}

/// Open the plugin info store.
pub(crate) fn info_store(config: &Config) -> Result<Arc<dyn InfoStore>> {
    let kv = FileKvStore::open(&config.info.dir)
        .with_context(|| format!("failed to open info store at {}", config.info.dir.display()))?;
    Ok(Arc::new(KvInfoStore::new(
        Arc::new(kv),
        config.info.namespace.clone(),
    )?))
}

/// The info store behind a read-only view, for commands that only report.
pub(crate) fn read_only_info_store(config: &Config) -> Result<Arc<dyn InfoStore>> {
    Ok(Arc::new(ReadOnlyInfoStore::new(info_store(config)?)))
}

fn lock_cache(config: &Config) -> Result<Arc<dyn SessionCache>> {
    let lock = &config.lock;
    Ok(match lock.backend {
        LockBackend::File => Arc::new(
            FileSessionCache::open(&lock.dir, lock.ttl())
                .with_context(|| format!("failed to open lock cache at {}", lock.dir.display()))?,
        ),
        LockBackend::Memory => Arc::new(MemorySessionCache::new(lock.ttl(), lock.max_capacity)),
    })
}

/// Assemble the loader service from every configured collaborator.
pub(crate) fn loader_service(config: &Config) -> Result<LoaderService> {
    let cache = PackageCache::open(&config.cache.dir)
        .with_context(|| format!("failed to open package cache at {}", config.cache.dir.display()))?;

    let shared = SharedPatterns::new()
        .with_patterns(&config.isolation.shared_packages)
        .context("invalid isolation.shared_packages")?;
    let wasm = WasmRuntime::new()
        .with_memory_limit(config.isolation.wasm_max_memory_bytes())
        .with_timeout(config.isolation.wasm_timeout());
    let runtimes = RuntimeRegistry::empty()
        .with_runtime(Arc::new(wasm))
        .with_runtime(Arc::new(DeclarativeRuntime::new()));

    Ok(LoaderService::builder(
        repository(config)?,
        info_store(config)?,
        Arc::new(cache),
        lock_cache(config)?,
    )
    .with_shared_patterns(shared)
    .with_runtimes(runtimes)
    .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cache.dir = dir.join("cache");
        config.repository.root = dir.join("storage");
        config.info.dir = dir.join("datastore");
        config.lock.dir = dir.join("locks");
        config
    }

    #[test]
    fn log_config_follows_logging_section() {
        let mut config = Config::default();
        config.logging.level = "debug".into();
        config.logging.format = "json".into();
        config.logging.directives = vec!["keel_plugins=trace".into()];

        let log = to_log_config(&config).unwrap();
        assert_eq!(log.level, "debug");
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.target, LogTarget::Stderr);
        assert_eq!(log.directives, vec!["keel_plugins=trace".to_string()]);
    }

    #[test]
    fn file_target_carries_rotation_settings() {
        let mut config = Config::default();
        config.logging.target = "file".into();
        config.logging.file_dir = "/var/log/keel".into();
        config.logging.file_prefix = "host".into();
        config.logging.rotation = "hourly".into();
        config.logging.max_files = 24;

        let log = to_log_config(&config).unwrap();
        assert_eq!(log.target, LogTarget::File("/var/log/keel".into()));
        assert_eq!(log.file.prefix, "host");
        assert_eq!(log.file.rotation, FileRotation::Hourly);
        assert_eq!(log.file.max_files, 24);
    }

    #[test]
    fn invalid_log_settings_are_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        let err = to_log_config(&config).unwrap_err();
        assert!(format!("{err:#}").contains("logging.format"));

        let mut config = Config::default();
        config.logging.target = "file".into();
        config.logging.rotation = "weekly".into();
        let err = to_log_config(&config).unwrap_err();
        assert!(format!("{err:#}").contains("logging.rotation"));

        let mut config = Config::default();
        config.logging.target = "syslog".into();
        assert!(to_log_config(&config).is_err());
    }

    #[tokio::test]
    async fn read_only_repository_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.repository.read_only = true;

        let repository = repository(&config).unwrap();
        assert!(repository.upsert("plugins/a.pkg", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn service_opens_on_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let service = loader_service(&config).unwrap();
        let report = service.scan().await.unwrap();
        assert!(report.is_unchanged());
        assert!(dir.path().join("cache").is_dir());
    }
}
