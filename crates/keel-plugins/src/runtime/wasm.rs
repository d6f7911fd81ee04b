//! WebAssembly modules backed by Extism.
//!
//! A module that exports both `configure` and `shutdown` implements the
//! entry-point contract. Every construction builds a new Extism instance, so
//! no linear memory or globals are shared between plugins or between two
//! activations of the same plugin.
//!
//! Guest ABI (all payloads are UTF-8 JSON):
//! - `configure("")` returns `{"id","name","description"?,"systemMessages"?,"tools"?}`
//!   where each tool is a [`ToolSchema`]
//! - `apply({"tool","params"})` returns the tool output as a string
//! - `shutdown("")` releases guest resources

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use extism::{Manifest, PluginBuilder, Wasm};
use keel_plugin_api::{
    ApiError, ApiResult, ENTRY_POINT_CONTRACT, PluginDescriptor, PluginEntryPoint, Tool,
    ToolSchema,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::isolation::EntryPointConstructor;
use crate::plugin::PluginId;
use crate::runtime::{ModuleDefinition, ModuleRuntime};

/// Default maximum WASM linear memory: 64 MB.
const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default maximum execution time per call: 30 seconds.
const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// WASM page size.
const WASM_PAGE_SIZE: u64 = 64 * 1024;

const CONFIGURE_EXPORT: &str = "configure";
const SHUTDOWN_EXPORT: &str = "shutdown";
const APPLY_EXPORT: &str = "apply";

/// Runtime for `.wasm` modules.
///
/// # Example
///
/// ```rust
/// use keel_plugins::runtime::WasmRuntime;
/// use std::time::Duration;
///
/// let runtime = WasmRuntime::new()
///     .with_memory_limit(32 * 1024 * 1024)
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WasmRuntime {
    limits: Limits,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_memory_bytes: u64,
    max_execution_time: Duration,
}

impl Default for WasmRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmRuntime {
    /// Create a runtime with default limits (64 MB memory, 30s timeout).
    #[must_use]
    pub fn new() -> Self {
        Self {
            limits: Limits {
                max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
                max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            },
        }
    }

    /// Set the maximum WASM linear memory in bytes.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.max_memory_bytes = bytes;
        self
    }

    /// Set the maximum execution time per WASM call.
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.limits.max_execution_time = duration;
        self
    }

    /// Get the configured memory limit.
    #[must_use]
    pub fn max_memory_bytes(&self) -> u64 {
        self.limits.max_memory_bytes
    }

    /// Get the configured execution timeout.
    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        self.limits.max_execution_time
    }
}

impl Limits {
    /// Build a fresh Extism instance from module bytes.
    fn instantiate(&self, code: &[u8]) -> PluginResult<extism::Plugin> {
        let mut manifest = Manifest::new([Wasm::data(code.to_vec())]);
        manifest = manifest.with_timeout(self.max_execution_time);
        // WASM pages are 64KB each; cap at u32::MAX pages if the byte limit is very large
        let pages = self.max_memory_bytes / WASM_PAGE_SIZE;
        let max_pages = u32::try_from(pages).unwrap_or(u32::MAX);
        manifest = manifest.with_memory_max(max_pages);

        PluginBuilder::new(manifest)
            .with_wasi(true)
            .build()
            .map_err(|e| PluginError::WasmError(format!("failed to build Extism plugin: {e}")))
    }
}

impl ModuleRuntime for WasmRuntime {
    fn extension(&self) -> &'static str {
        "wasm"
    }

    fn define(
        &self,
        plugin_id: &PluginId,
        symbol: &str,
        code: Arc<[u8]>,
    ) -> PluginResult<ModuleDefinition> {
        let instance = self.limits.instantiate(&code)?;
        let is_entry_point = instance.function_exists(CONFIGURE_EXPORT)
            && instance.function_exists(SHUTDOWN_EXPORT);
        drop(instance);

        debug!(plugin_id = %plugin_id, symbol, is_entry_point, "defined WASM module");
        if !is_entry_point {
            return Ok(ModuleDefinition {
                supertypes: Vec::new(),
                constructor: None,
            });
        }

        let limits = self.limits;
        let id = plugin_id.clone();
        let ctor = move || -> PluginResult<Arc<dyn PluginEntryPoint>> {
            let plugin = limits.instantiate(&code)?;
            Ok(Arc::new(WasmEntryPoint {
                plugin_id: id.clone(),
                plugin: Arc::new(Mutex::new(plugin)),
            }))
        };
        Ok(ModuleDefinition {
            supertypes: vec![ENTRY_POINT_CONTRACT.to_string()],
            constructor: Some(Arc::new(ctor) as Arc<dyn EntryPointConstructor>),
        })
    }
}

/// Run a guest export on the blocking pool, so any runtime flavor can await
/// it. Calls into one instance are serialised by its mutex.
async fn call_export(
    plugin: &Arc<Mutex<extism::Plugin>>,
    export: &'static str,
    input: String,
) -> Result<String, String> {
    let plugin = Arc::clone(plugin);
    tokio::task::spawn_blocking(move || {
        let mut plugin = plugin
            .lock()
            .map_err(|e| format!("plugin lock poisoned: {e}"))?;
        plugin
            .call::<&str, String>(export, &input)
            .map_err(|e| format!("{export} call failed: {e}"))
    })
    .await
    .map_err(|e| format!("{export} call did not complete: {e}"))?
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestDescriptor {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    system_messages: Vec<String>,
    #[serde(default)]
    tools: Vec<ToolSchema>,
}

/// One live WASM plugin instance.
struct WasmEntryPoint {
    plugin_id: PluginId,
    plugin: Arc<Mutex<extism::Plugin>>,
}

#[async_trait]
impl PluginEntryPoint for WasmEntryPoint {
    async fn configure(&self) -> ApiResult<PluginDescriptor> {
        let raw = call_export(&self.plugin, CONFIGURE_EXPORT, String::new())
            .await
            .map_err(ApiError::Configure)?;
        let guest: GuestDescriptor = serde_json::from_str(&raw)
            .map_err(|e| ApiError::Configure(format!("invalid configure output: {e}")))?;

        let mut builder = PluginDescriptor::builder(guest.id, guest.name);
        if let Some(description) = guest.description {
            builder = builder.with_description(description);
        }
        for message in guest.system_messages {
            builder = builder.with_system_message(message);
        }
        for schema in guest.tools {
            builder = builder.with_tool(Arc::new(WasmTool {
                schema,
                plugin: Arc::clone(&self.plugin),
            }));
        }
        builder.build()
    }

    async fn shutdown(&self) -> ApiResult<()> {
        call_export(&self.plugin, SHUTDOWN_EXPORT, String::new())
            .await
            .map(|_| ())
            .map_err(ApiError::Shutdown)
    }
}

impl std::fmt::Debug for WasmEntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEntryPoint")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

/// A tool backed by the guest's `apply` export.
///
/// Tools of one instance share its `Arc<Mutex<extism::Plugin>>` since WASM
/// execution is inherently single-threaded.
struct WasmTool {
    schema: ToolSchema,
    plugin: Arc<Mutex<extism::Plugin>>,
}

#[async_trait]
impl Tool for WasmTool {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn description(&self) -> Option<&str> {
        self.schema.description.as_deref()
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn apply(&self, params: Value) -> ApiResult<String> {
        let input = json!({ "tool": self.schema.name, "params": params }).to_string();
        call_export(&self.plugin, APPLY_EXPORT, input)
            .await
            .map_err(|message| ApiError::ToolFailed {
                tool: self.schema.name.clone(),
                message,
            })
    }
}
