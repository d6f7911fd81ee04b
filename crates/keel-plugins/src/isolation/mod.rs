//! Per-plugin symbol isolation.
//!
//! Every active plugin gets its own [`IsolatedLoader`]. A lookup by
//! fully-qualified name resolves, in order:
//!
//! 1. from the loader's own cache of already-resolved symbols;
//! 2. from the host namespace, if the name matches a [`SharedPatterns`]
//!    entry and the host has it;
//! 3. from the plugin's own package (including bundled `lib/*.pkg`);
//!
//! and fails with `SymbolNotFound` otherwise. No loader ever consults another
//! plugin's package.

mod host;
mod loader;
mod patterns;
mod symbol;

pub use host::{HostNamespace, HostResolver};
pub use loader::{EntryPointHandle, IsolatedLoader, LoaderContext};
pub use patterns::SharedPatterns;
pub use symbol::{EntryPointConstructor, Symbol, SymbolOrigin};
