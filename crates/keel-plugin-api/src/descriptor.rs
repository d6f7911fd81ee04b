//! Plugin descriptor returned by [`PluginEntryPoint::configure`](crate::PluginEntryPoint::configure).

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::tool::Tool;

/// What a configured plugin contributes to the host.
#[derive(Clone)]
pub struct PluginDescriptor {
    /// Plugin identifier. Matches the id in the package metadata.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// System messages appended to every conversation.
    pub system_messages: Vec<String>,
    /// Tools the plugin exposes.
    pub tools: Vec<Arc<dyn Tool>>,
}

impl PluginDescriptor {
    /// Start building a descriptor.
    #[must_use]
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> PluginDescriptorBuilder {
        PluginDescriptorBuilder::new(id, name)
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("system_messages", &self.system_messages.len())
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`PluginDescriptor`].
pub struct PluginDescriptorBuilder {
    id: String,
    name: String,
    description: Option<String>,
    system_messages: Vec<String>,
    tools: Vec<Arc<dyn Tool>>,
}

impl PluginDescriptorBuilder {
    /// Create a builder with the required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            system_messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a system message.
    #[must_use]
    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_messages.push(message.into());
        self
    }

    /// Append a tool.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Finish the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidSchema`] if two tools share a name or a
    /// tool schema is structurally invalid.
    pub fn build(self) -> ApiResult<PluginDescriptor> {
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_string()) {
                return Err(ApiError::InvalidSchema(format!(
                    "duplicate tool name: {}",
                    tool.name()
                )));
            }
            tool.schema().validate()?;
        }
        Ok(PluginDescriptor {
            id: self.id,
            name: self.name,
            description: self.description,
            system_messages: self.system_messages,
            tools: self.tools,
        })
    }
}

impl std::fmt::Debug for PluginDescriptorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptorBuilder")
            .field("id", &self.id)
            .field("tool_count", &self.tools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ToolSchema;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo {
        schema: ToolSchema,
    }

    impl Echo {
        fn named(name: &str) -> Arc<dyn Tool> {
            Arc::new(Self {
                schema: ToolSchema::new(name),
            })
        }
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            &self.schema.name
        }

        fn description(&self) -> Option<&str> {
            None
        }

        fn schema(&self) -> &ToolSchema {
            &self.schema
        }

        async fn apply(&self, params: Value) -> ApiResult<String> {
            Ok(params.to_string())
        }
    }

    #[test]
    fn builder_collects_contributions() {
        let descriptor = PluginDescriptor::builder("sysinfo", "System Info")
            .with_description("host facts")
            .with_system_message("You can read system information.")
            .with_tool(Echo::named("echo"))
            .build()
            .unwrap();

        assert_eq!(descriptor.id, "sysinfo");
        assert_eq!(descriptor.system_messages.len(), 1);
        assert!(descriptor.tool("echo").is_some());
        assert!(descriptor.tool("missing").is_none());
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let result = PluginDescriptor::builder("p", "P")
            .with_tool(Echo::named("same"))
            .with_tool(Echo::named("same"))
            .build();
        assert!(matches!(result, Err(ApiError::InvalidSchema(_))));
    }

    #[tokio::test]
    async fn tools_are_callable_through_descriptor() {
        let descriptor = PluginDescriptor::builder("p", "P")
            .with_tool(Echo::named("echo"))
            .build()
            .unwrap();
        let out = descriptor
            .tool("echo")
            .unwrap()
            .apply(serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }
}
