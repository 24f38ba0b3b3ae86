//! Model-driven authoring of a unit's source.
//!
//! The model must deliver source through the `deliver_component` tool; free
//! text is never treated as source.

use std::fmt::Write as _;

use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use morph_core::ids::ComponentId;
use morph_core::messages::{Message, ModelResponse};
use morph_core::tools::{ToolChoice, ToolDefinition};
use morph_llm::{CallExtras, Transport};

use crate::error::AuthoringError;
use crate::pipeline::host::{LuaHost, RUNTIME_MODULE};
use crate::shape::describe_inputs;

pub const DELIVER_TOOL: &str = "deliver_component";

pub struct AuthoringRequest<'a> {
    pub component_id: &'a ComponentId,
    pub inputs: &'a Map<String, Value>,
    /// Domain tools the unit's reasoning loop can call.
    pub tools: &'a [ToolDefinition],
    pub handlers: &'a [String],
    /// Present when re-authoring; the model adapts it rather than starting over.
    pub existing_source: Option<&'a str>,
    pub reason: Option<&'a str>,
}

pub fn deliver_definition() -> ToolDefinition {
    ToolDefinition::new(
        DELIVER_TOOL,
        "Deliver the complete Lua source of the component module.",
        json!({
            "type": "object",
            "properties": { "source": { "type": "string" } },
            "required": ["source"]
        }),
    )
}

const GUIDELINES: &str = "\
- The module returns a table with `render(props, state)` returning `view, new_state`.
  `new_state` is optional; omit it to keep the current state.
- An optional `init_state(props)` returns the initial state table.
- `props.inputs` holds the declared inputs, `props.handlers` the handler names,
  and `props.reasoning` the reasoning snapshot (status, response, stale,
  status_text, turn, max_turns).
- Handle a nil `props.reasoning.response`: reasoning may not have answered yet.
- Keep the view a plain table of strings, numbers, booleans and nested tables.
- Do not read files or globals other than the ones listed here.";

pub fn authoring_system_prompt(req: &AuthoringRequest<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "You write the Lua module for UI component `{}`. Deliver it by calling `{DELIVER_TOOL}`.",
        req.component_id
    );

    out.push_str("\n## Input shape\n");
    let shape = describe_inputs(req.inputs);
    if shape.is_empty() {
        out.push_str("(no inputs)\n");
    } else {
        let _ = writeln!(out, "{shape}");
    }

    out.push_str("\n## Tools available to its reasoning loop\n");
    if req.tools.is_empty() {
        out.push_str("(none)\n");
    }
    for tool in req.tools {
        let _ = writeln!(out, "- {}: {}", tool.name, tool.description);
    }

    out.push_str("\n## Handlers\n");
    if req.handlers.is_empty() {
        out.push_str("(none)\n");
    } else {
        let _ = writeln!(out, "{}", req.handlers.join(", "));
    }

    out.push_str("\n## Host module\n");
    let _ = writeln!(
        out,
        "`local rt = require(\"{RUNTIME_MODULE}\")` provides `rt.atom(key, default)`, \
         `rt.set_atom(key, value)`, `rt.on_teardown(fn)` and `rt.log(message)`."
    );

    out.push_str("\n## Guidelines\n");
    out.push_str(GUIDELINES);
    out.push('\n');

    if let Some(existing) = req.existing_source {
        out.push_str("\n## Current source\nAdapt this module rather than discarding it.\n");
        let _ = writeln!(out, "```lua\n{existing}\n```");
    }
    out
}

/// Pull the delivered source out of a response.
pub fn extract_source(response: &ModelResponse) -> Result<String, AuthoringError> {
    let call = response
        .tool_calls()
        .into_iter()
        .find(|c| c.name == DELIVER_TOOL)
        .ok_or(AuthoringError::NoDelivery)?;
    let source = call
        .input
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if source.trim().is_empty() {
        return Err(AuthoringError::EmptySource);
    }
    LuaHost::check_syntax(DELIVER_TOOL, source).map_err(|e| AuthoringError::InvalidSource(e.to_string()))?;
    Ok(source.to_string())
}

#[instrument(skip_all, fields(component_id = %req.component_id))]
pub async fn author(transport: &Transport, req: &AuthoringRequest<'_>) -> Result<String, AuthoringError> {
    let system = authoring_system_prompt(req);
    let prompt = match (req.existing_source, req.reason) {
        (Some(_), Some(reason)) => format!("Regenerate the component. Reason: {reason}"),
        (Some(_), None) => "The component's interface changed. Update it.".to_string(),
        (None, _) => "Write the component.".to_string(),
    };
    let extras = CallExtras::with_tools(vec![deliver_definition()]).tool_choice(ToolChoice::Tool {
        name: DELIVER_TOOL.into(),
    });

    let tag = format!("authoring:{}", req.component_id);
    let response = transport.call(&tag, &system, &[Message::user_text(prompt)], extras).await?;

    match extract_source(&response) {
        Ok(source) => {
            info!(bytes = source.len(), "component authored");
            Ok(source)
        }
        Err(e) => {
            warn!(error = %e, "authoring produced no usable source");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_core::errors::TransportError;
    use morph_llm::{ScriptedBackend, ScriptedResponse, TranscriptLog};
    use std::sync::Arc;

    fn transport(script: Vec<ScriptedResponse>) -> (Arc<ScriptedBackend>, Transport) {
        let backend = Arc::new(ScriptedBackend::new(script));
        let transport = Transport::new(backend.clone(), Arc::new(TranscriptLog::new()), "m", 1024);
        (backend, transport)
    }

    fn inputs() -> Map<String, Value> {
        json!({"objective": ""}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn delivered_source_is_extracted() {
        let (backend, transport) = transport(vec![ScriptedResponse::tool_use(
            DELIVER_TOOL,
            json!({"source": "return { render = function() return 'hi' end }"}),
        )]);
        let id = ComponentId::from_raw("greeter");
        let inputs = inputs();
        let handlers = vec!["onSubmit".to_string()];
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &[],
            handlers: &handlers,
            existing_source: None,
            reason: None,
        };

        let source = author(&transport, &req).await.unwrap();
        assert!(source.contains("render"));

        let request = backend.last_request().unwrap();
        assert_eq!(request.tools.len(), 1);
        assert_eq!(
            request.tool_choice,
            Some(ToolChoice::Tool {
                name: DELIVER_TOOL.into()
            })
        );
        assert!(request.system.contains("objective: string:empty"));
        assert!(request.system.contains("onSubmit"));
        assert!(!request.system.contains("## Current source"));
        assert_eq!(transport.transcript().by_source("authoring:greeter").len(), 1);
    }

    #[tokio::test]
    async fn free_text_is_not_source() {
        let (_, transport) = transport(vec![ScriptedResponse::text("return {}")]);
        let id = ComponentId::from_raw("x");
        let inputs = Map::new();
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &[],
            handlers: &[],
            existing_source: None,
            reason: None,
        };
        assert!(matches!(author(&transport, &req).await, Err(AuthoringError::NoDelivery)));
    }

    #[tokio::test]
    async fn empty_delivery_is_rejected() {
        let (_, transport) = transport(vec![ScriptedResponse::tool_use(DELIVER_TOOL, json!({"source": "  \n"}))]);
        let id = ComponentId::from_raw("x");
        let inputs = Map::new();
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &[],
            handlers: &[],
            existing_source: None,
            reason: None,
        };
        assert!(matches!(author(&transport, &req).await, Err(AuthoringError::EmptySource)));
    }

    #[tokio::test]
    async fn unparsable_delivery_is_rejected() {
        let (_, transport) = transport(vec![ScriptedResponse::tool_use(
            DELIVER_TOOL,
            json!({"source": "return { render = function( end"}),
        )]);
        let id = ComponentId::from_raw("x");
        let inputs = Map::new();
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &[],
            handlers: &[],
            existing_source: None,
            reason: None,
        };
        assert!(matches!(
            author(&transport, &req).await,
            Err(AuthoringError::InvalidSource(_))
        ));
    }

    #[tokio::test]
    async fn transport_errors_propagate() {
        let (_, transport) = transport(vec![ScriptedResponse::Error(TransportError::Status {
            status: 500,
            body: "boom".into(),
        })]);
        let id = ComponentId::from_raw("x");
        let inputs = Map::new();
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &[],
            handlers: &[],
            existing_source: None,
            reason: None,
        };
        let err = author(&transport, &req).await.unwrap_err();
        assert_eq!(err.to_string(), "transport error: 500: boom");
    }

    #[test]
    fn reauthoring_prompt_embeds_existing_source() {
        let id = ComponentId::from_raw("x");
        let inputs = Map::new();
        let tools = vec![ToolDefinition::untyped("save", "persist it")];
        let req = AuthoringRequest {
            component_id: &id,
            inputs: &inputs,
            tools: &tools,
            handlers: &[],
            existing_source: Some("return { render = old }"),
            reason: Some("needs a chart"),
        };
        let prompt = authoring_system_prompt(&req);
        assert!(prompt.contains("## Current source"));
        assert!(prompt.contains("return { render = old }"));
        assert!(prompt.contains("- save: persist it"));
        assert!(prompt.contains("(no inputs)"));
    }
}
