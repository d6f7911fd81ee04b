//! Tool parameter schemas.
//!
//! A [`ToolSchema`] is a named map of [`SchemaProperty`] values. Scalar
//! properties carry only a type; `object` properties nest further properties
//! and `array` properties carry an item schema. [`ToolSchema::to_json_schema`]
//! renders the JSON Schema form that language-model backends expect.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ApiError, ApiResult};

/// Value type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// UTF-8 string.
    String,
    /// Floating point number.
    Number,
    /// Whole number.
    Integer,
    /// `true` / `false`.
    Boolean,
    /// Nested object with its own properties.
    Object,
    /// Homogeneous list.
    Array,
}

impl SchemaType {
    /// The JSON Schema `type` keyword for this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One property of a tool schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProperty {
    /// Value type.
    #[serde(rename = "type")]
    pub kind: SchemaType,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether callers must supply this property.
    #[serde(default)]
    pub required: bool,
    /// Nested properties (objects only).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaProperty>,
    /// Item schema (arrays only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaProperty>>,
}

impl SchemaProperty {
    /// A scalar property of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidSchema`] for `object` and `array`, which
    /// have dedicated constructors.
    pub fn scalar(kind: SchemaType, description: Option<&str>, required: bool) -> ApiResult<Self> {
        if matches!(kind, SchemaType::Object | SchemaType::Array) {
            return Err(ApiError::InvalidSchema(format!(
                "{} is not a scalar type",
                kind.as_str()
            )));
        }
        Ok(Self {
            kind,
            description: description.map(String::from),
            required,
            properties: BTreeMap::new(),
            items: None,
        })
    }

    /// A required string property.
    #[must_use]
    pub fn string(description: &str) -> Self {
        Self {
            kind: SchemaType::String,
            description: Some(description.to_string()),
            required: true,
            properties: BTreeMap::new(),
            items: None,
        }
    }

    /// An object property with nested properties.
    #[must_use]
    pub fn object(
        description: Option<&str>,
        required: bool,
        properties: BTreeMap<String, SchemaProperty>,
    ) -> Self {
        Self {
            kind: SchemaType::Object,
            description: description.map(String::from),
            required,
            properties,
            items: None,
        }
    }

    /// An array property with the given item schema.
    #[must_use]
    pub fn array(description: Option<&str>, required: bool, items: SchemaProperty) -> Self {
        Self {
            kind: SchemaType::Array,
            description: description.map(String::from),
            required,
            properties: BTreeMap::new(),
            items: Some(Box::new(items)),
        }
    }

    /// Check the structural rules for this property and its children.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidSchema`] when an array has no item schema,
    /// or a non-object property carries nested properties.
    pub fn validate(&self, path: &str) -> ApiResult<()> {
        match self.kind {
            SchemaType::Array => match &self.items {
                Some(items) => items.validate(&format!("{path}[]"))?,
                None => {
                    return Err(ApiError::InvalidSchema(format!(
                        "array property {path} has no item schema"
                    )));
                },
            },
            SchemaType::Object => {
                for (name, child) in &self.properties {
                    child.validate(&format!("{path}.{name}"))?;
                }
            },
            _ => {
                if !self.properties.is_empty() || self.items.is_some() {
                    return Err(ApiError::InvalidSchema(format!(
                        "scalar property {path} must not nest properties or items"
                    )));
                }
            },
        }
        Ok(())
    }

    fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), Value::String(self.kind.as_str().into()));
        if let Some(description) = &self.description {
            out.insert("description".into(), Value::String(description.clone()));
        }
        match self.kind {
            SchemaType::Object => {
                let (props, required) = render_properties(&self.properties);
                out.insert("properties".into(), props);
                out.insert("required".into(), required);
            },
            SchemaType::Array => {
                if let Some(items) = &self.items {
                    out.insert("items".into(), items.to_json_schema());
                }
            },
            _ => {},
        }
        Value::Object(out)
    }
}

/// Parameter schema of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Schema name, usually the tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Top-level parameters.
    #[serde(default)]
    pub properties: BTreeMap<String, SchemaProperty>,
}

impl ToolSchema {
    /// An empty schema (tool takes no parameters).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a top-level property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, property: SchemaProperty) -> Self {
        self.properties.insert(name.into(), property);
        self
    }

    /// Validate every property.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidSchema`] on the first violation found.
    pub fn validate(&self) -> ApiResult<()> {
        for (name, property) in &self.properties {
            property.validate(name)?;
        }
        Ok(())
    }

    /// Render as a JSON Schema object.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let (props, required) = render_properties(&self.properties);
        let mut schema = json!({
            "type": "object",
            "properties": props,
            "required": required,
        });
        if let (Some(description), Some(obj)) = (&self.description, schema.as_object_mut()) {
            obj.insert("description".into(), Value::String(description.clone()));
        }
        schema
    }
}

fn render_properties(properties: &BTreeMap<String, SchemaProperty>) -> (Value, Value) {
    let mut props = Map::new();
    let mut required = Vec::new();
    for (name, property) in properties {
        props.insert(name.clone(), property.to_json_schema());
        if property.required {
            required.push(Value::String(name.clone()));
        }
    }
    (Value::Object(props), Value::Array(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_rejects_container_types() {
        assert!(SchemaProperty::scalar(SchemaType::Object, None, false).is_err());
        assert!(SchemaProperty::scalar(SchemaType::Array, None, false).is_err());
        assert!(SchemaProperty::scalar(SchemaType::Integer, Some("n"), true).is_ok());
    }

    #[test]
    fn array_without_items_is_invalid() {
        let mut prop = SchemaProperty::array(None, false, SchemaProperty::string("x"));
        prop.items = None;
        let schema = ToolSchema::new("t").with_property("list", prop);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn json_schema_lists_required_properties() {
        let schema = ToolSchema::new("lookup")
            .with_description("Look something up")
            .with_property("query", SchemaProperty::string("search text"))
            .with_property(
                "limit",
                SchemaProperty::scalar(SchemaType::Integer, None, false).unwrap(),
            );

        let rendered = schema.to_json_schema();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["description"], "Look something up");
        assert_eq!(rendered["properties"]["limit"]["type"], "integer");
        assert_eq!(rendered["required"], json!(["query"]));
    }

    #[test]
    fn nested_object_renders_children() {
        let mut inner = BTreeMap::new();
        inner.insert("city".to_string(), SchemaProperty::string("city name"));
        let schema = ToolSchema::new("weather").with_property(
            "location",
            SchemaProperty::object(None, true, inner),
        );

        let rendered = schema.to_json_schema();
        assert_eq!(
            rendered["properties"]["location"]["properties"]["city"]["type"],
            "string"
        );
        assert_eq!(
            rendered["properties"]["location"]["required"],
            json!(["city"])
        );
    }

    #[test]
    fn deserializes_lowercase_type_tag() {
        let prop: SchemaProperty =
            serde_json::from_str(r#"{"type":"array","items":{"type":"boolean"}}"#).unwrap();
        assert_eq!(prop.kind, SchemaType::Array);
        assert_eq!(prop.items.unwrap().kind, SchemaType::Boolean);
    }
}
