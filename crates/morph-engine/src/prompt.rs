use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde_json::Value;

use morph_core::ids::ComponentId;
use morph_core::tools::ToolDefinition;

use crate::truncate::render_value;

type DerivedPrompt = Arc<dyn Fn(Option<&Value>, &Value) -> String + Send + Sync>;

/// The user-turn prompt of a reasoning run: fixed text, or a function of the
/// previous and current dependency snapshots.
#[derive(Clone)]
pub enum PromptSource {
    Literal(String),
    Derived(DerivedPrompt),
}

impl PromptSource {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> String + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    pub fn text(&self, previous: Option<&Value>, current: &Value) -> String {
        match self {
            Self::Literal(text) => text.clone(),
            Self::Derived(f) => f(previous, current),
        }
    }
}

impl fmt::Debug for PromptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Everything the reasoning system prompt embeds.
pub struct PromptContext<'a> {
    pub component_id: &'a ComponentId,
    pub tools: &'a [ToolDefinition],
    pub own_source: Option<&'a str>,
    pub atoms: &'a BTreeMap<String, Value>,
    pub siblings: &'a [String],
    pub previous: Option<&'a Value>,
    pub current: &'a Value,
    pub ceiling: usize,
}

pub fn reasoning_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are the reasoning loop of generated UI unit `{}`. Perceive what changed in its \
         inputs and act through tools. Call `respond` to publish a response (you may call it \
         again later). Call `reshape` only when the unit's structure cannot serve its inputs; \
         it ends reasoning and regenerates the unit. Reply without tool calls when you are done.",
        ctx.component_id
    );

    out.push_str("\n## Tools\n");
    for tool in ctx.tools {
        let _ = writeln!(out, "- {}: {}", tool.name, tool.description);
    }

    out.push_str("\n## Your source\n");
    match ctx.own_source {
        Some(source) => {
            let _ = writeln!(out, "```lua\n{}\n```", crate::truncate::truncate_output(source, ctx.ceiling));
        }
        None => out.push_str("(not authored yet)\n"),
    }

    out.push_str("\n## Shared atoms\n");
    if ctx.atoms.is_empty() {
        out.push_str("(none)\n");
    }
    for (key, value) in ctx.atoms {
        let _ = writeln!(out, "- {key} = {}", render_value(value, ctx.ceiling));
    }

    out.push_str("\n## Sibling units\n");
    if ctx.siblings.is_empty() {
        out.push_str("(none)\n");
    } else {
        let _ = writeln!(out, "{}", ctx.siblings.join(", "));
    }

    out.push_str("\n## Previous inputs\n");
    match ctx.previous {
        Some(previous) => {
            let _ = writeln!(out, "{}", render_value(previous, ctx.ceiling));
        }
        None => out.push_str("(first run)\n"),
    }

    out.push_str("\n## Current inputs\n");
    let _ = writeln!(out, "{}", render_value(ctx.current, ctx.ceiling));
    out
}
