//! Plugin error types.

use crate::PluginId;

/// Errors from plugin packaging, isolation and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No record exists for the plugin.
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// The plugin ID is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// A cache filename or derived package name is invalid.
    #[error("invalid package name '{name}': {reason}")]
    InvalidPackageName {
        /// The invalid name.
        name: String,
        /// Why the name is invalid.
        reason: String,
    },

    /// The package has no `META-INF/plugin.json` entry.
    #[error("plugin metadata not found in {locator}")]
    MetadataNotFound {
        /// Package that was read.
        locator: String,
    },

    /// The package could not be opened or its metadata could not be decoded.
    #[error("corrupt package {locator}: {message}")]
    CorruptArchive {
        /// Package that was read.
        locator: String,
        /// What went wrong.
        message: String,
    },

    /// Non-overwriting write hit an existing file or record.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A symbol could not be resolved through the plugin's loader.
    #[error("symbol {symbol} not found for plugin {plugin_id}")]
    SymbolNotFound {
        /// Plugin whose loader was asked.
        plugin_id: PluginId,
        /// Fully-qualified symbol name.
        symbol: String,
    },

    /// A symbol's supertype chain refers back to itself.
    #[error("cyclic supertype chain at {symbol} in plugin {plugin_id}")]
    CyclicSymbol {
        /// Plugin whose loader was asked.
        plugin_id: PluginId,
        /// Symbol where the cycle closed.
        symbol: String,
    },

    /// The declared entry point does not implement the host contract.
    #[error("invalid entry point {symbol} for plugin {plugin_id}: {reason}")]
    InvalidEntryPoint {
        /// Plugin being enabled.
        plugin_id: PluginId,
        /// Declared entry-point symbol.
        symbol: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Another holder owns the ephemeral lock for this key.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// The loader was closed and can no longer resolve symbols.
    #[error("loader for plugin {0} is closed")]
    LoaderClosed(PluginId),

    /// The plugin's own `configure` or `shutdown` failed.
    #[error("entry point of plugin {plugin_id} failed: {message}")]
    EntryPoint {
        /// Plugin whose entry point failed.
        plugin_id: PluginId,
        /// Failure reported by the plugin.
        message: String,
    },

    /// No module runtime handles this code unit.
    #[error("unsupported module {symbol} (extension '{extension}')")]
    UnsupportedModule {
        /// Symbol being defined.
        symbol: String,
        /// File extension of the code unit.
        extension: String,
    },

    /// WASM runtime error (Extism/Wasmtime).
    #[error("WASM error: {0}")]
    WasmError(String),

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path traversal detected in archive entry.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path.
        path: String,
    },

    /// Unsafe entry type in archive (e.g. symlink, hardlink, device node).
    #[error("unsafe archive entry type '{entry_type}' at {path}")]
    UnsafeEntryType {
        /// The entry type that was rejected.
        entry_type: String,
        /// The path of the entry.
        path: String,
    },

    /// Package exceeds the maximum allowed size.
    #[error("package too large: {size} bytes (limit: {limit} bytes)")]
    PackageTooLarge {
        /// Size seen so far in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        limit: u64,
    },
}

impl From<keel_storage::StorageError> for PluginError {
    fn from(e: keel_storage::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(e))
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
