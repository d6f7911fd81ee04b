//! Host-side symbol namespace.

use std::collections::HashMap;
use std::sync::Arc;

use keel_plugin_api::{ENTRY_POINT_CONTRACT, TOOL_CONTRACT};

use crate::isolation::symbol::Symbol;

/// Resolves names against the host's own namespace.
pub trait HostResolver: Send + Sync {
    /// Look up a host symbol by fully-qualified name.
    fn resolve(&self, name: &str) -> Option<Arc<Symbol>>;
}

/// The host namespace: the contract types plus anything the host registers.
///
/// One instance is shared by every loader, so contract symbols keep a single
/// identity across all plugins.
#[derive(Debug, Clone)]
pub struct HostNamespace {
    symbols: HashMap<String, Arc<Symbol>>,
}

impl Default for HostNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl HostNamespace {
    /// A namespace holding the plugin contract symbols.
    #[must_use]
    pub fn new() -> Self {
        let mut symbols = HashMap::new();
        for name in [ENTRY_POINT_CONTRACT, TOOL_CONTRACT] {
            symbols.insert(name.to_string(), Arc::new(Symbol::contract(name)));
        }
        Self { symbols }
    }

    /// Register an additional host symbol, replacing one with the same name.
    #[must_use]
    pub fn with_symbol(mut self, symbol: Symbol) -> Self {
        self.symbols
            .insert(symbol.name().to_string(), Arc::new(symbol));
        self
    }

    /// Sorted names of every host symbol.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.symbols.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl HostResolver for HostNamespace {
    fn resolve(&self, name: &str) -> Option<Arc<Symbol>> {
        self.symbols.get(name).cloned()
    }
}
