//! Resolved symbols.

use std::fmt;
use std::sync::Arc;

use keel_plugin_api::PluginEntryPoint;

use crate::error::PluginResult;
use crate::plugin::PluginId;

/// Builds fresh entry-point instances through a zero-argument constructor.
pub trait EntryPointConstructor: Send + Sync {
    /// Create a new, independent instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying module cannot be instantiated.
    fn construct(&self) -> PluginResult<Arc<dyn PluginEntryPoint>>;
}

impl<F> EntryPointConstructor for F
where
    F: Fn() -> PluginResult<Arc<dyn PluginEntryPoint>> + Send + Sync,
{
    fn construct(&self) -> PluginResult<Arc<dyn PluginEntryPoint>> {
        self()
    }
}

/// Namespace a symbol was defined in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolOrigin {
    /// Provided by the host and shared with every plugin.
    Host,
    /// Defined by one plugin's own package.
    Plugin(PluginId),
}

/// A fully resolved symbol.
///
/// Identity matters: two symbols with the same name from different
/// namespaces are different types, and [`Symbol::is_assignable_to`] compares
/// by identity, never by name.
pub struct Symbol {
    name: String,
    origin: SymbolOrigin,
    supertypes: Vec<Arc<Symbol>>,
    constructor: Option<Arc<dyn EntryPointConstructor>>,
}

impl Symbol {
    /// A host-provided contract type with no supertypes and no constructor.
    #[must_use]
    pub fn contract(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: SymbolOrigin::Host,
            supertypes: Vec::new(),
            constructor: None,
        }
    }

    /// A symbol from the given origin.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        origin: SymbolOrigin,
        supertypes: Vec<Arc<Symbol>>,
        constructor: Option<Arc<dyn EntryPointConstructor>>,
    ) -> Self {
        Self {
            name: name.into(),
            origin,
            supertypes,
            constructor,
        }
    }

    /// Fully-qualified name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the symbol was defined.
    #[must_use]
    pub fn origin(&self) -> &SymbolOrigin {
        &self.origin
    }

    /// Direct supertypes.
    #[must_use]
    pub fn supertypes(&self) -> &[Arc<Symbol>] {
        &self.supertypes
    }

    /// Whether the symbol has a zero-argument constructor.
    #[must_use]
    pub fn is_constructible(&self) -> bool {
        self.constructor.is_some()
    }

    pub(crate) fn constructor(&self) -> Option<&Arc<dyn EntryPointConstructor>> {
        self.constructor.as_ref()
    }

    /// Whether this symbol is `target` or transitively extends it.
    #[must_use]
    pub fn is_assignable_to(&self, target: &Arc<Symbol>) -> bool {
        std::ptr::eq(self, Arc::as_ptr(target))
            || self.supertypes.iter().any(|s| s.is_assignable_to(target))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field(
                "supertypes",
                &self.supertypes.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}
