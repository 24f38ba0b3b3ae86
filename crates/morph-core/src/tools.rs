use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolUseId;

/// Tool definition sent to the model (`tools[]` in the request).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Definition with a permissive object schema, for tools declared by name only.
    pub fn untyped(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(
            name,
            description,
            serde_json::json!({"type": "object", "additionalProperties": true}),
        )
    }
}

/// Tool-choice policy (`tool_choice` in the request).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

/// A single tool invocation extracted from a model response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolUseId,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    /// Pull a required string argument out of a tool input object.
    pub fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
        input
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments(format!("missing string field `{field}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_wire_shape() {
        let json = serde_json::to_value(ToolChoice::Tool {
            name: "deliver_component".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "tool", "name": "deliver_component"}));
        assert_eq!(
            serde_json::to_value(ToolChoice::Auto).unwrap(),
            serde_json::json!({"type": "auto"})
        );
    }

    #[test]
    fn untyped_definition_accepts_any_object() {
        let def = ToolDefinition::untyped("add_todo", "Add a todo item");
        assert_eq!(def.input_schema["type"], "object");
        assert_eq!(def.input_schema["additionalProperties"], true);
    }

    #[test]
    fn require_str_reports_field() {
        let input = serde_json::json!({"key": 3});
        let err = ToolError::require_str(&input, "key").unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: missing string field `key`");
        let input = serde_json::json!({"key": "theme"});
        assert_eq!(ToolError::require_str(&input, "key").unwrap(), "theme");
    }
}
