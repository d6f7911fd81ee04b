//! Configuration types for the keel plugin host.
//!
//! Every struct implements [`Default`] matching `defaults.toml`, so a bare
//! `[section]` header in TOML produces a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local package cache.
    pub cache: CacheSection,
    /// Shared remote package repository.
    pub repository: RepositorySection,
    /// Plugin info store.
    pub info: InfoSection,
    /// Distributed ephemeral lock backing cache.
    pub lock: LockSection,
    /// Module isolation settings.
    pub isolation: IsolationSection,
    /// Repository scanner schedule.
    pub scanner: ScannerSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Local package cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Directory holding cached `<id>[-<version>].pkg` archives.
    pub dir: PathBuf,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/plugin-cache"),
        }
    }
}

/// File-backed remote package repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    /// Repository root directory.
    pub root: PathBuf,
    /// Open the repository read-only (uploads and removals are rejected).
    pub read_only: bool,
}

impl Default for RepositorySection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/storage"),
            read_only: false,
        }
    }
}

/// Plugin info store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoSection {
    /// Directory of the key-value datastore.
    pub dir: PathBuf,
    /// Namespace holding plugin records.
    pub namespace: String,
}

impl Default for InfoSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/datastore"),
            namespace: "plugins".to_owned(),
        }
    }
}

/// Backend of the shared TTL cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Directory shared by every host process on the machine.
    #[default]
    File,
    /// Process-local in-memory cache.
    Memory,
}

/// Distributed ephemeral lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    /// Cache backend.
    pub backend: LockBackend,
    /// Directory used by the `file` backend.
    pub dir: PathBuf,
    /// Seconds before an abandoned lock entry expires.
    pub ttl_secs: u64,
    /// Maximum entries held by the `memory` backend.
    pub max_capacity: u64,
}

impl LockSection {
    /// TTL as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            backend: LockBackend::File,
            dir: PathBuf::from("./data/locks"),
            ttl_secs: 60,
            max_capacity: 10_000,
        }
    }
}

/// Module isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSection {
    /// Extra shared-namespace patterns resolved through the host first
    /// (`a.b.*` prefix or `a.b.C` exact).
    pub shared_packages: Vec<String>,
    /// WebAssembly linear memory cap per plugin instance, in MiB.
    pub wasm_max_memory_mb: u64,
    /// WebAssembly execution timeout per call, in seconds.
    pub wasm_timeout_secs: u64,
}

impl IsolationSection {
    /// Memory cap in bytes.
    #[must_use]
    pub fn wasm_max_memory_bytes(&self) -> u64 {
        self.wasm_max_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Per-call timeout.
    #[must_use]
    pub fn wasm_timeout(&self) -> Duration {
        Duration::from_secs(self.wasm_timeout_secs)
    }
}

impl Default for IsolationSection {
    fn default() -> Self {
        Self {
            shared_packages: Vec::new(),
            wasm_max_memory_mb: 64,
            wasm_timeout_secs: 30,
        }
    }
}

/// Repository scanner schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    /// Run a scan when the host starts.
    pub scan_on_startup: bool,
    /// Seconds between periodic scans.
    pub interval_secs: u64,
}

impl ScannerSection {
    /// Interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            scan_on_startup: true,
            interval_secs: 60,
        }
    }
}

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["keel_plugins=debug"]`).
    pub directives: Vec<String>,
    /// Where events go: `"stdout"`, `"stderr"`, or `"file"`.
    pub target: String,
    /// Directory of the rolling log files when `target = "file"`.
    pub file_dir: PathBuf,
    /// File name prefix of the rolling log files.
    pub file_prefix: String,
    /// `"daily"`, `"hourly"`, `"minutely"`, or `"never"`.
    pub rotation: String,
    /// Rotated files to keep; 0 keeps all.
    pub max_files: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            target: "stderr".to_owned(),
            file_dir: PathBuf::from("./data/logs"),
            file_prefix: "keel".to_owned(),
            rotation: "daily".to_owned(),
            max_files: 0,
        }
    }
}
