use serde_json::{json, Value};

use morph_core::tools::ToolDefinition;

pub const RESPOND: &str = "respond";
pub const RESHAPE: &str = "reshape";

/// Reserved tools handled by the reasoning loop itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalTool {
    /// Sets the unit's latest response. Does not end the run.
    Respond,
    /// Ends the run and asks for the unit to be regenerated.
    Reshape,
}

impl TerminalTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            RESPOND => Some(Self::Respond),
            RESHAPE => Some(Self::Reshape),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Respond => RESPOND,
            Self::Reshape => RESHAPE,
        }
    }
}

pub fn default_respond_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "content": { "type": "string", "description": "The response to show" }
        },
        "required": ["content"]
    })
}

pub fn respond_definition(schema: Option<&Value>) -> ToolDefinition {
    ToolDefinition::new(
        RESPOND,
        "Publish the unit's current response. May be called more than once; the last call wins. \
         Does not end your turn sequence.",
        schema.cloned().unwrap_or_else(default_respond_schema),
    )
}

pub fn reshape_definition() -> ToolDefinition {
    ToolDefinition::new(
        RESHAPE,
        "Request that this unit's source be discarded and regenerated because its current \
         structure cannot serve the inputs. Ends reasoning immediately.",
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the unit must be regenerated" }
            },
            "required": ["reason"]
        }),
    )
}
