//! Declarative (`.json`) modules.
//!
//! A declarative module describes a prompt-only plugin without code:
//!
//! ```json
//! {
//!   "implements": ["keel.api.PluginEntryPoint"],
//!   "descriptor": {
//!     "id": "sysinfo",
//!     "name": "System Info",
//!     "systemMessages": ["You can report host details."],
//!     "tools": [{
//!       "name": "greet",
//!       "properties": { "who": { "type": "string", "required": true } },
//!       "response": "Hello, {who}!"
//!     }]
//!   }
//! }
//! ```
//!
//! Modules without a `descriptor` only contribute a type to the supertype
//! graph and cannot be instantiated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keel_plugin_api::{
    ApiError, ApiResult, PluginDescriptor, PluginEntryPoint, Tool, ToolSchema,
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, PluginResult};
use crate::isolation::EntryPointConstructor;
use crate::plugin::PluginId;
use crate::runtime::{ModuleDefinition, ModuleRuntime};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ModuleSpec {
    #[serde(default)]
    implements: Vec<String>,
    #[serde(default)]
    descriptor: Option<DescriptorSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorSpec {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    system_messages: Vec<String>,
    #[serde(default)]
    tools: Vec<TemplateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateSpec {
    #[serde(flatten)]
    schema: ToolSchema,
    response: String,
}

/// Runtime for `.json` modules.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclarativeRuntime;

impl DeclarativeRuntime {
    /// Create the runtime.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ModuleRuntime for DeclarativeRuntime {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn define(
        &self,
        plugin_id: &PluginId,
        symbol: &str,
        code: Arc<[u8]>,
    ) -> PluginResult<ModuleDefinition> {
        let spec: ModuleSpec =
            serde_json::from_slice(&code).map_err(|e| PluginError::CorruptArchive {
                locator: format!("{plugin_id}:{symbol}"),
                message: format!("invalid declarative module: {e}"),
            })?;

        let constructor = spec.descriptor.map(|descriptor| {
            let descriptor = Arc::new(descriptor);
            let ctor = move || -> PluginResult<Arc<dyn PluginEntryPoint>> {
                Ok(Arc::new(DeclarativeEntryPoint {
                    spec: Arc::clone(&descriptor),
                    shut_down: AtomicBool::new(false),
                }))
            };
            Arc::new(ctor) as Arc<dyn EntryPointConstructor>
        });

        Ok(ModuleDefinition {
            supertypes: spec.implements,
            constructor,
        })
    }
}

/// One live instance of a declarative plugin.
struct DeclarativeEntryPoint {
    spec: Arc<DescriptorSpec>,
    shut_down: AtomicBool,
}

#[async_trait]
impl PluginEntryPoint for DeclarativeEntryPoint {
    async fn configure(&self) -> ApiResult<PluginDescriptor> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ApiError::Configure("instance was shut down".into()));
        }
        let spec = &self.spec;
        let mut builder = PluginDescriptor::builder(&spec.id, &spec.name);
        if let Some(description) = &spec.description {
            builder = builder.with_description(description);
        }
        for message in &spec.system_messages {
            builder = builder.with_system_message(message);
        }
        for tool in &spec.tools {
            builder = builder.with_tool(Arc::new(TemplateTool(tool.clone())));
        }
        builder.build()
    }

    async fn shutdown(&self) -> ApiResult<()> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

/// A tool that renders its response template from the call parameters.
struct TemplateTool(TemplateSpec);

#[async_trait]
impl Tool for TemplateTool {
    fn name(&self) -> &str {
        &self.0.schema.name
    }

    fn description(&self) -> Option<&str> {
        self.0.schema.description.as_deref()
    }

    fn schema(&self) -> &ToolSchema {
        &self.0.schema
    }

    async fn apply(&self, params: Value) -> ApiResult<String> {
        let params = match params {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(ApiError::InvalidParams {
                    tool: self.name().to_string(),
                    message: format!("expected an object, got {other}"),
                });
            },
        };

        for (name, property) in &self.0.schema.properties {
            if property.required && !params.contains_key(name) {
                return Err(ApiError::InvalidParams {
                    tool: self.name().to_string(),
                    message: format!("missing required parameter '{name}'"),
                });
            }
        }

        let mut response = self.0.response.clone();
        for (name, value) in &params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            response = response.replace(&format!("{{{name}}}"), &rendered);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn define(json: &str) -> PluginResult<ModuleDefinition> {
        DeclarativeRuntime::new().define(
            &PluginId::from_static("sysinfo"),
            "com.example.SysInfo",
            Arc::from(json.as_bytes()),
        )
    }

    const SYSINFO: &str = r#"{
        "implements": ["keel.api.PluginEntryPoint"],
        "descriptor": {
            "id": "sysinfo",
            "name": "System Info",
            "systemMessages": ["Report host details when asked."],
            "tools": [{
                "name": "greet",
                "description": "Say hello",
                "properties": {
                    "who": { "type": "string", "required": true },
                    "times": { "type": "integer" }
                },
                "response": "Hello, {who} x{times}!"
            }]
        }
    }"#;

    #[tokio::test]
    async fn configure_builds_descriptor_with_template_tools() {
        let def = define(SYSINFO).unwrap();
        assert_eq!(def.supertypes, vec!["keel.api.PluginEntryPoint"]);
        let entry = def.constructor.unwrap().construct().unwrap();

        let descriptor = entry.configure().await.unwrap();
        assert_eq!(descriptor.id, "sysinfo");
        assert_eq!(descriptor.system_messages.len(), 1);

        let tool = descriptor.tool("greet").unwrap();
        assert_eq!(tool.description(), Some("Say hello"));
        let out = tool.apply(json!({"who": "Ada", "times": 2})).await.unwrap();
        assert_eq!(out, "Hello, Ada x2!");

        let err = tool.apply(json!({"times": 2})).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParams { .. }));
        assert!(tool.apply(json!("nope")).await.is_err());
    }

    #[tokio::test]
    async fn each_construction_is_a_fresh_instance() {
        let ctor = define(SYSINFO).unwrap().constructor.unwrap();
        let first = ctor.construct().unwrap();
        let second = ctor.construct().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        first.shutdown().await.unwrap();
        assert!(first.configure().await.is_err());
        assert!(second.configure().await.is_ok());
    }

    #[test]
    fn type_only_modules_have_no_constructor() {
        let def = define(r#"{"implements": ["com.example.Base"]}"#).unwrap();
        assert_eq!(def.supertypes, vec!["com.example.Base"]);
        assert!(def.constructor.is_none());
    }

    #[test]
    fn malformed_module_is_corrupt() {
        assert!(matches!(
            define("{ nope"),
            Err(PluginError::CorruptArchive { .. })
        ));
        assert!(matches!(
            define(r#"{"unexpected": 1}"#),
            Err(PluginError::CorruptArchive { .. })
        ));
    }
}
