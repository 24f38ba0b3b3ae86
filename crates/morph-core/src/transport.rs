use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::TransportError;
use crate::messages::{Message, ModelResponse};
use crate::tools::{ToolChoice, ToolDefinition};

/// Request body shared by every addressing mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Arbitrary provider fields (temperature, metadata, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Something that can answer a [`ModelRequest`]: an HTTP endpoint, a relay,
/// or a scripted backend in tests.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, TransportError>;
}
