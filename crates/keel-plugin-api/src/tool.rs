//! Tool contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiResult;
use crate::schema::ToolSchema;

/// A tool contributed by a plugin.
///
/// Names are loaded at runtime, so accessors return borrowed `&str` rather
/// than `&'static str`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (unique within the plugin).
    fn name(&self) -> &str;

    /// Human-readable description, if the plugin provides one.
    fn description(&self) -> Option<&str>;

    /// Declared parameter schema.
    fn schema(&self) -> &ToolSchema;

    /// Invoke the tool with a JSON object of parameters.
    async fn apply(&self, params: Value) -> ApiResult<String>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
