//! The isolated loader.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_plugin_api::{ENTRY_POINT_CONTRACT, PluginEntryPoint};
use tracing::{debug, info};

use crate::archive::{ModuleSource, PackageLocator, read_contents};
use crate::error::{PluginError, PluginResult};
use crate::isolation::host::HostResolver;
use crate::isolation::patterns::SharedPatterns;
use crate::isolation::symbol::{Symbol, SymbolOrigin};
use crate::model::PluginMetadata;
use crate::plugin::PluginId;
use crate::runtime::RuntimeRegistry;

/// Collaborators shared by every loader of one host.
#[derive(Clone)]
pub struct LoaderContext {
    /// Host namespace for shared names.
    pub host: Arc<dyn HostResolver>,
    /// Names resolved through the host first.
    pub shared: Arc<SharedPatterns>,
    /// Module runtimes by extension.
    pub runtimes: Arc<RuntimeRegistry>,
}

impl LoaderContext {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        host: Arc<dyn HostResolver>,
        shared: SharedPatterns,
        runtimes: RuntimeRegistry,
    ) -> Self {
        Self {
            host,
            shared: Arc::new(shared),
            runtimes: Arc::new(runtimes),
        }
    }
}

impl std::fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderContext")
            .field("shared", &self.shared)
            .field("runtimes", &self.runtimes)
            .finish_non_exhaustive()
    }
}

struct LoaderState {
    modules: BTreeMap<String, ModuleSource>,
    resolved: HashMap<String, Arc<Symbol>>,
    closed: bool,
}

/// One plugin's private symbol namespace.
///
/// The package's module table is read into memory when the loader opens, so
/// the loader holds no file handles afterwards. Resolution is serialised by a
/// per-loader mutex: a symbol is defined at most once per loader.
pub struct IsolatedLoader {
    plugin_id: PluginId,
    metadata: PluginMetadata,
    locator: PackageLocator,
    context: LoaderContext,
    state: Mutex<LoaderState>,
}

impl IsolatedLoader {
    /// Open the package at `locator` and build its namespace.
    ///
    /// Blocking: reads the whole package.
    ///
    /// # Errors
    ///
    /// Returns the archive reader's errors if the package is unreadable.
    pub fn open(locator: PackageLocator, context: LoaderContext) -> PluginResult<Self> {
        let contents = read_contents(&locator)?;
        let plugin_id = contents.metadata.id.clone();
        debug!(
            plugin_id = %plugin_id,
            locator = %locator,
            modules = contents.modules.len(),
            "opened isolated loader"
        );
        Ok(Self {
            plugin_id,
            metadata: contents.metadata,
            locator,
            context,
            state: Mutex::new(LoaderState {
                modules: contents.modules,
                resolved: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// The plugin this loader belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Metadata of the loaded package.
    #[must_use]
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Where the package was loaded from.
    #[must_use]
    pub fn locator(&self) -> &PackageLocator {
        &self.locator
    }

    /// Names of the symbols the package defines. Empty once closed.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        self.lock_state().modules.keys().cloned().collect()
    }

    /// Whether [`IsolatedLoader::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Resolve a symbol by fully-qualified name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SymbolNotFound`] if neither the host (for
    /// shared names) nor the package defines it,
    /// [`PluginError::CyclicSymbol`] for self-referential supertypes,
    /// [`PluginError::UnsupportedModule`] if no runtime handles the code
    /// unit, and [`PluginError::LoaderClosed`] after close.
    pub fn resolve(&self, name: &str) -> PluginResult<Arc<Symbol>> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PluginError::LoaderClosed(self.plugin_id.clone()));
        }
        let mut stack = Vec::new();
        self.resolve_locked(&mut state, name, &mut stack)
    }

    fn resolve_locked(
        &self,
        state: &mut LoaderState,
        name: &str,
        stack: &mut Vec<String>,
    ) -> PluginResult<Arc<Symbol>> {
        if let Some(symbol) = state.resolved.get(name) {
            return Ok(Arc::clone(symbol));
        }

        if self.context.shared.matches(name)
            && let Some(symbol) = self.context.host.resolve(name)
        {
            debug!(plugin_id = %self.plugin_id, symbol = name, "resolved from host");
            state.resolved.insert(name.to_string(), Arc::clone(&symbol));
            return Ok(symbol);
        }

        let Some(source) = state.modules.get(name).cloned() else {
            return Err(PluginError::SymbolNotFound {
                plugin_id: self.plugin_id.clone(),
                symbol: name.to_string(),
            });
        };
        if stack.iter().any(|s| s == name) {
            return Err(PluginError::CyclicSymbol {
                plugin_id: self.plugin_id.clone(),
                symbol: name.to_string(),
            });
        }

        let runtime = self.context.runtimes.get(&source.extension).ok_or_else(|| {
            PluginError::UnsupportedModule {
                symbol: name.to_string(),
                extension: source.extension.clone(),
            }
        })?;
        let definition = runtime.define(&self.plugin_id, name, source.code)?;

        stack.push(name.to_string());
        let mut supertypes = Vec::with_capacity(definition.supertypes.len());
        for supertype in &definition.supertypes {
            supertypes.push(self.resolve_locked(state, supertype, stack)?);
        }
        stack.pop();

        let symbol = Arc::new(Symbol::new(
            name,
            SymbolOrigin::Plugin(self.plugin_id.clone()),
            supertypes,
            definition.constructor,
        ));
        debug!(
            plugin_id = %self.plugin_id,
            symbol = name,
            origin = %source.origin,
            "defined symbol from package"
        );
        state.resolved.insert(name.to_string(), Arc::clone(&symbol));
        Ok(symbol)
    }

    /// Resolve the declared entry point and check it against the host
    /// contract.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidEntryPoint`] if the symbol does not
    /// implement `keel.api.PluginEntryPoint` or cannot be constructed, plus
    /// any resolution error.
    pub fn load_entry_point(&self) -> PluginResult<EntryPointHandle> {
        let name = self.metadata.entry_point.as_str();
        let invalid = |reason: &str| PluginError::InvalidEntryPoint {
            plugin_id: self.plugin_id.clone(),
            symbol: name.to_string(),
            reason: reason.to_string(),
        };

        let symbol = self.resolve(name)?;
        let contract = self
            .context
            .host
            .resolve(ENTRY_POINT_CONTRACT)
            .ok_or_else(|| invalid("host does not provide the entry-point contract"))?;
        if !symbol.is_assignable_to(&contract) {
            return Err(invalid("does not implement keel.api.PluginEntryPoint"));
        }
        if !symbol.is_constructible() {
            return Err(invalid("has no zero-argument constructor"));
        }
        Ok(EntryPointHandle {
            plugin_id: self.plugin_id.clone(),
            symbol,
        })
    }

    /// Drop every resolved symbol and the module table. Later lookups fail
    /// with [`PluginError::LoaderClosed`].
    pub fn close(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.modules.clear();
        state.resolved.clear();
        info!(plugin_id = %self.plugin_id, "closed isolated loader");
    }

    /// State is only mutated after a successful step, so a panic elsewhere
    /// cannot leave it inconsistent.
    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("plugin_id", &self.plugin_id)
            .field("locator", &self.locator.to_string())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A verified, constructible entry-point type.
#[derive(Debug, Clone)]
pub struct EntryPointHandle {
    plugin_id: PluginId,
    symbol: Arc<Symbol>,
}

impl EntryPointHandle {
    /// The entry-point symbol.
    #[must_use]
    pub fn symbol(&self) -> &Arc<Symbol> {
        &self.symbol
    }

    /// Create a new instance through the zero-argument constructor.
    ///
    /// # Errors
    ///
    /// Returns the runtime's instantiation error.
    pub fn instantiate(&self) -> PluginResult<Arc<dyn PluginEntryPoint>> {
        let constructor =
            self.symbol
                .constructor()
                .ok_or_else(|| PluginError::InvalidEntryPoint {
                    plugin_id: self.plugin_id.clone(),
                    symbol: self.symbol.name().to_string(),
                    reason: "has no zero-argument constructor".into(),
                })?;
        constructor.construct()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::METADATA_PATH;
    use crate::isolation::HostNamespace;
    use crate::test_support::{ENTRY_POINT_MODULE, metadata_json, package_bytes};

    fn context() -> LoaderContext {
        LoaderContext::new(
            Arc::new(HostNamespace::new().with_symbol(Symbol::contract("keel.common.Clock"))),
            SharedPatterns::new(),
            RuntimeRegistry::default(),
        )
    }

    fn open(dir: &tempfile::TempDir, entries: &[(&str, &[u8])]) -> IsolatedLoader {
        let path = dir.path().join("demo.pkg");
        std::fs::write(&path, package_bytes(entries)).unwrap();
        IsolatedLoader::open(PackageLocator::path(path), context()).unwrap()
    }

    fn meta() -> String {
        metadata_json("demo", None, "com.example.Main")
    }

    #[test]
    fn shared_names_resolve_from_host_first() {
        let dir = tempfile::tempdir().unwrap();
        let look_alike = br#"{"implements": []}"#;
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/keel/api/PluginEntryPoint.json", look_alike),
            ],
        );

        let symbol = loader.resolve(ENTRY_POINT_CONTRACT).unwrap();
        assert_eq!(symbol.origin(), &SymbolOrigin::Host);
    }

    #[test]
    fn shared_names_fall_through_to_package() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/keel/common/Local.json", br#"{"implements": []}"#),
            ],
        );

        let host_symbol = loader.resolve("keel.common.Clock").unwrap();
        assert_eq!(host_symbol.origin(), &SymbolOrigin::Host);
        let local = loader.resolve("keel.common.Local").unwrap();
        assert_eq!(
            local.origin(),
            &SymbolOrigin::Plugin(PluginId::from_static("demo"))
        );
        assert!(matches!(
            loader.resolve("keel.common.Missing"),
            Err(PluginError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn unshared_names_never_come_from_host() {
        let dir = tempfile::tempdir().unwrap();
        let context = LoaderContext::new(
            Arc::new(HostNamespace::new().with_symbol(Symbol::contract("com.host.Internal"))),
            SharedPatterns::new(),
            RuntimeRegistry::default(),
        );
        let path = dir.path().join("demo.pkg");
        std::fs::write(&path, package_bytes(&[(METADATA_PATH, meta().as_bytes())])).unwrap();
        let loader = IsolatedLoader::open(PackageLocator::path(path), context).unwrap();

        assert!(matches!(
            loader.resolve("com.host.Internal"),
            Err(PluginError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn resolution_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/Main.json", ENTRY_POINT_MODULE.as_bytes()),
            ],
        );
        let a = loader.resolve("com.example.Main").unwrap();
        let b = loader.resolve("com.example.Main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn entry_point_through_local_base_type() {
        let dir = tempfile::tempdir().unwrap();
        let main = ENTRY_POINT_MODULE.replace("keel.api.PluginEntryPoint", "com.example.Base");
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/Main.json", main.as_bytes()),
                (
                    "modules/com/example/Base.json",
                    br#"{"implements": ["keel.api.PluginEntryPoint"]}"#,
                ),
            ],
        );
        let handle = loader.load_entry_point().unwrap();
        assert_eq!(handle.symbol().name(), "com.example.Main");
        assert!(handle.instantiate().is_ok());
    }

    #[test]
    fn entry_point_must_implement_host_contract() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                (
                    "modules/com/example/Main.json",
                    ENTRY_POINT_MODULE
                        .replace("keel.api.PluginEntryPoint", "com.example.Fake")
                        .as_bytes(),
                ),
                ("modules/com/example/Fake.json", br#"{"implements": []}"#),
            ],
        );
        assert!(matches!(
            loader.load_entry_point(),
            Err(PluginError::InvalidEntryPoint { .. })
        ));
    }

    #[test]
    fn missing_entry_point_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(&dir, &[(METADATA_PATH, meta().as_bytes())]);
        assert!(matches!(
            loader.load_entry_point(),
            Err(PluginError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn cycles_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/A.json", br#"{"implements": ["com.example.B"]}"#),
                ("modules/com/example/B.json", br#"{"implements": ["com.example.A"]}"#),
            ],
        );
        assert!(matches!(
            loader.resolve("com.example.A"),
            Err(PluginError::CyclicSymbol { .. })
        ));
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/Main.class", b"\xca\xfe\xba\xbe"),
            ],
        );
        assert!(matches!(
            loader.resolve("com.example.Main"),
            Err(PluginError::UnsupportedModule { .. })
        ));
    }

    #[test]
    fn closed_loader_rejects_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let loader = open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/Main.json", ENTRY_POINT_MODULE.as_bytes()),
            ],
        );
        loader.resolve("com.example.Main").unwrap();
        loader.close();
        assert!(loader.is_closed());
        assert!(loader.module_names().is_empty());
        assert!(matches!(
            loader.resolve("com.example.Main"),
            Err(PluginError::LoaderClosed(_))
        ));
    }

    #[test]
    fn concurrent_lookups_define_once() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(open(
            &dir,
            &[
                (METADATA_PATH, meta().as_bytes()),
                ("modules/com/example/Main.json", ENTRY_POINT_MODULE.as_bytes()),
            ],
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loader = Arc::clone(&loader);
                std::thread::spawn(move || loader.resolve("com.example.Main").unwrap())
            })
            .collect();
        let symbols: Vec<Arc<Symbol>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(symbols.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
