//! Offloading of blocking filesystem work.

use crate::error::PluginResult;

/// Run blocking archive or cache I/O on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> PluginResult<T>
where
    F: FnOnce() -> PluginResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
