//! CLI command implementations.

pub(crate) mod plugin;
pub(crate) mod run;
