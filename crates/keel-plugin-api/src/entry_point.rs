//! The plugin entry-point contract.

use async_trait::async_trait;

use crate::descriptor::PluginDescriptor;
use crate::error::ApiResult;

/// The single type every plugin package exposes to the host.
///
/// The host instantiates it through a zero-argument constructor, calls
/// [`configure`](Self::configure) once to learn what the plugin contributes,
/// and calls [`shutdown`](Self::shutdown) exactly once when the plugin is
/// disabled, removed, or the host exits.
#[async_trait]
pub trait PluginEntryPoint: Send + Sync {
    /// Declare the tools and system messages this plugin contributes.
    async fn configure(&self) -> ApiResult<PluginDescriptor>;

    /// Release any resources held by the plugin.
    async fn shutdown(&self) -> ApiResult<()>;
}

impl std::fmt::Debug for dyn PluginEntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEntryPoint").finish_non_exhaustive()
    }
}
