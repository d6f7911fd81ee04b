//! Module runtimes.
//!
//! A runtime turns one code unit from a package into a [`ModuleDefinition`]:
//! the names of its declared supertypes plus, for instantiable types, a
//! zero-argument constructor. The loader picks the runtime by the code
//! unit's file extension.

mod declarative;
mod wasm;

use std::collections::HashMap;
use std::sync::Arc;

pub use declarative::DeclarativeRuntime;
pub use wasm::WasmRuntime;

use crate::error::PluginResult;
use crate::isolation::EntryPointConstructor;
use crate::plugin::PluginId;

/// What a runtime learned from defining one code unit.
pub struct ModuleDefinition {
    /// Fully-qualified names of direct supertypes, resolved by the loader.
    pub supertypes: Vec<String>,
    /// Constructor for instantiable types.
    pub constructor: Option<Arc<dyn EntryPointConstructor>>,
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("supertypes", &self.supertypes)
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}

/// Defines symbols from code units of one file type.
pub trait ModuleRuntime: Send + Sync {
    /// File extension handled by this runtime, without the dot.
    fn extension(&self) -> &'static str;

    /// Define `symbol` from `code`, on behalf of `plugin_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the code unit is malformed.
    fn define(
        &self,
        plugin_id: &PluginId,
        symbol: &str,
        code: Arc<[u8]>,
    ) -> PluginResult<ModuleDefinition>;
}

/// Runtimes keyed by extension.
#[derive(Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<&'static str, Arc<dyn ModuleRuntime>>,
}

impl Default for RuntimeRegistry {
    /// WASM with default limits plus declarative modules.
    fn default() -> Self {
        Self::empty()
            .with_runtime(Arc::new(WasmRuntime::new()))
            .with_runtime(Arc::new(DeclarativeRuntime::new()))
    }
}

impl RuntimeRegistry {
    /// A registry with no runtimes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            runtimes: HashMap::new(),
        }
    }

    /// Register a runtime, replacing any with the same extension.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.runtimes.insert(runtime.extension(), runtime);
        self
    }

    /// The runtime for `extension`.
    #[must_use]
    pub fn get(&self, extension: &str) -> Option<&Arc<dyn ModuleRuntime>> {
        self.runtimes.get(extension)
    }

    /// Sorted list of handled extensions.
    #[must_use]
    pub fn extensions(&self) -> Vec<&'static str> {
        let mut exts: Vec<&'static str> = self.runtimes.keys().copied().collect();
        exts.sort_unstable();
        exts
    }
}

impl std::fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}
