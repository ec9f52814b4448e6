//! Tool definition and metadata

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON Schema for tool parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// JSON Schema for input parameters
    pub parameters: Value,
}

impl ToolSchema {
    /// Create a schema from a JSON Schema value
    pub fn new(parameters: Value) -> Self {
        Self { parameters }
    }

    /// Create an empty schema (tool takes no parameters)
    pub fn empty() -> Self {
        Self {
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    /// Names listed under `required`
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self::empty()
    }
}

/// Host resources a tool may read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolScope {
    /// Filenames of uploads whose fragments `index.search` may return
    #[serde(default)]
    pub readable_uploads: Vec<String>,
}

/// An operator-authored tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Stable identifier, used to scope fragment searches
    pub id: String,

    /// Tool name (also part of the LLM feature tag)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Guest source defining `invoke(params)` and optionally `details()`
    pub script: String,

    /// Parameter schema
    #[serde(default)]
    pub schema: ToolSchema,

    /// Readable resources
    #[serde(default)]
    pub scope: ToolScope,
}

impl ToolDefinition {
    /// Create a definition with required fields
    pub fn new(id: impl Into<String>, name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            script: script.into(),
            schema: ToolSchema::empty(),
            scope: ToolScope::default(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set parameter schema
    pub fn with_schema(mut self, schema: ToolSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Allow `index.search` to return fragments of this upload
    pub fn with_readable_upload(mut self, filename: impl Into<String>) -> Self {
        self.scope.readable_uploads.push(filename.into());
        self
    }

    /// Check required parameters are present before a session starts
    pub fn missing_parameters(&self, parameters: &Value) -> Vec<String> {
        self.schema
            .required()
            .into_iter()
            .filter(|name| parameters.get(name).is_none_or(Value::is_null))
            .map(str::to_string)
            .collect()
    }
}
