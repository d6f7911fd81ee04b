//! Shared fixtures for the keel-plugins integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use keel_plugins::{KvInfoStore, LoaderService, PackageCache};
use keel_storage::{MemoryBlobStore, MemoryKvStore, MemorySessionCache};

/// One simulated host process: private info store and cache, shared
/// repository and lock cache.
pub struct Host {
    pub info: Arc<KvInfoStore>,
    pub cache: Arc<PackageCache>,
    pub service: LoaderService,
}

impl Host {
    pub fn new(
        root: &Path,
        name: &str,
        repository: &Arc<MemoryBlobStore>,
        locks: &Arc<MemorySessionCache>,
    ) -> Self {
        let info = Arc::new(KvInfoStore::new(Arc::new(MemoryKvStore::new()), "plugins").unwrap());
        let cache = Arc::new(PackageCache::open(root.join(name).join("cache")).unwrap());
        let service = LoaderService::builder(
            repository.clone(),
            info.clone(),
            Arc::clone(&cache),
            locks.clone(),
        )
        .build();
        Self {
            info,
            cache,
            service,
        }
    }
}

pub fn lock_cache() -> Arc<MemorySessionCache> {
    Arc::new(MemorySessionCache::new(Duration::from_secs(60), 10_000))
}

/// A declarative entry point whose descriptor id is `id`.
pub fn entry_point_module(id: &str) -> String {
    serde_json::json!({
        "implements": ["keel.api.PluginEntryPoint"],
        "descriptor": {
            "id": id,
            "name": format!("{id} plugin"),
            "systemMessages": [format!("{id} is available.")],
            "tools": [{
                "name": "describe",
                "description": "Describe the host",
                "properties": {"field": {"type": "string", "required": true}},
                "response": "host {field}: unknown"
            }]
        }
    })
    .to_string()
}

/// A package with metadata and a declarative entry point at `entry_point`.
pub fn plugin_package(id: &str, version: Option<&str>, entry_point: &str) -> Vec<u8> {
    let mut meta = serde_json::json!({
        "id": id,
        "name": format!("{id} plugin"),
        "entryPoint": entry_point,
    });
    if let Some(version) = version {
        meta["version"] = serde_json::Value::from(version);
    }
    let module_path = format!("modules/{}.json", entry_point.replace('.', "/"));
    package_bytes(&[
        ("META-INF/plugin.json", meta.to_string().as_bytes()),
        (&module_path, entry_point_module(id).as_bytes()),
    ])
}

pub fn package_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}
