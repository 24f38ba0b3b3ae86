use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolUseId;
use crate::tools::ToolCall;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the `messages` list sent to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// Provider-native content block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: ToolUseId,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block types this runtime does not interpret (thinking, images, ...).
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Successful model reply: an ordered list of content blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool results travel back as a user-role message, one block per invocation.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }
}

impl ContentBlock {
    pub fn tool_result(tool_use_id: ToolUseId, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id,
            content: content.into(),
            is_error,
        }
    }
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: Some(StopReason::EndTurn),
            usage: None,
        }
    }

    pub fn from_blocks(content: Vec<ContentBlock>) -> Self {
        let stop_reason = if content
            .iter()
            .any(|c| matches!(c, ContentBlock::ToolUse { .. }))
        {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        Self {
            id: String::new(),
            model: String::new(),
            content,
            stop_reason: Some(stop_reason),
            usage: None,
        }
    }

    /// Tool invocations in block order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, ContentBlock::ToolUse { .. }))
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The assistant message to append to the running history.
    pub fn to_message(&self) -> Message {
        let content = self
            .content
            .iter()
            .filter(|c| !matches!(c, ContentBlock::Unknown))
            .cloned()
            .collect();
        Message::assistant(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_message() {
        let msg = Message::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "hello");
    }

    #[test]
    fn tool_result_block_wire_shape() {
        let block = ContentBlock::tool_result(ToolUseId::from_raw("toolu_1"), "ok", false);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "toolu_1");
        assert_eq!(json["content"], "ok");
        assert!(json.get("is_error").is_none());

        let block = ContentBlock::tool_result(ToolUseId::from_raw("toolu_2"), "boom", true);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["is_error"], true);
    }

    #[test]
    fn provider_response_parses() {
        let raw = serde_json::json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "abc"},
                {"type": "text", "text": "Let me check. "},
                {"type": "tool_use", "id": "toolu_a", "name": "read_atom", "input": {"key": "theme"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let resp: ModelResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(resp.text_content(), "Let me check. ");
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_atom");
        assert_eq!(calls[0].input["key"], "theme");
        assert_eq!(resp.usage.unwrap().output_tokens, 7);
    }

    #[test]
    fn unknown_blocks_are_dropped_from_history() {
        let resp = ModelResponse {
            id: String::new(),
            model: String::new(),
            content: vec![ContentBlock::Unknown, ContentBlock::Text { text: "hi".into() }],
            stop_reason: None,
            usage: None,
        };
        let msg = resp.to_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content.len(), 1);
    }

    #[test]
    fn from_blocks_sets_stop_reason() {
        let resp = ModelResponse::from_blocks(vec![ContentBlock::ToolUse {
            id: ToolUseId::new(),
            name: "respond".into(),
            input: serde_json::json!({"content": "x"}),
        }]);
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert!(resp.has_tool_calls());
        assert_eq!(ModelResponse::text("x").stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn unknown_stop_reason_tolerated() {
        let parsed: StopReason = serde_json::from_str(r#""pause_turn""#).unwrap();
        assert_eq!(parsed, StopReason::Other);
    }
}
