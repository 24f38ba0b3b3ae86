//! Tool dispatch table.
//!
//! A tool name resolves to exactly one route, tried in this order:
//! reserved terminal tools, built-in introspection tools, tools declared by
//! the parent (routed through the parent's dispatcher), locally declared
//! tools with an inline handler, then the generic fallback.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{error, warn};

use morph_core::tools::{ToolCall, ToolDefinition, ToolError};
use morph_llm::{TranscriptEntry, TranscriptLog};

use crate::tools::{respond_definition, reshape_definition, BuiltinContext, BuiltinTool, TerminalTool};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Dispatcher owned by a parent unit; children route the parent's tools
/// through it.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn dispatch(&self, call: &ToolCall) -> Result<Value, ToolError>;
}

pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;
pub type FallbackHandler = Arc<dyn Fn(ToolCall) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A tool declared by the unit itself.
#[derive(Clone)]
pub struct LocalTool {
    pub definition: ToolDefinition,
    pub handler: Option<ToolHandler>,
}

impl LocalTool {
    pub fn declared(definition: ToolDefinition) -> Self {
        Self {
            definition,
            handler: None,
        }
    }

    pub fn with_handler<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            definition,
            handler: Some(Arc::new(move |input| handler(input).boxed())),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Terminal(TerminalTool),
    BuiltIn(BuiltinTool),
    Parent,
    Local,
    Fallback,
    /// Declared locally without a handler and no fallback is installed.
    Unhandled,
    Unknown,
}

impl Route {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Terminal(_) => "terminal",
            Self::BuiltIn(_) => "builtin",
            Self::Parent => "parent",
            Self::Local => "local",
            Self::Fallback => "fallback",
            Self::Unhandled => "unhandled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug)]
pub struct Dispatched {
    pub route: Route,
    pub result: Result<Value, ToolError>,
}

impl Dispatched {
    /// Tool result text fed back to the model.
    pub fn content(&self) -> String {
        match &self.result {
            Ok(Value::String(s)) => s.clone(),
            Ok(Value::Null) => "null".into(),
            Ok(v) => v.to_string(),
            Err(e) => e.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

pub struct ToolTable {
    builtins: BuiltinContext,
    parent: Option<Arc<dyn ToolDispatcher>>,
    parent_defs: Vec<ToolDefinition>,
    local: Vec<LocalTool>,
    local_index: HashMap<String, usize>,
    fallback: Option<FallbackHandler>,
    transcript: Arc<TranscriptLog>,
    respond_schema: Option<Value>,
    tool_timeout: Duration,
}

impl ToolTable {
    pub fn new(builtins: BuiltinContext, transcript: Arc<TranscriptLog>) -> Self {
        Self {
            builtins,
            parent: None,
            parent_defs: Vec::new(),
            local: Vec::new(),
            local_index: HashMap::new(),
            fallback: None,
            transcript,
            respond_schema: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_parent(mut self, parent: Arc<dyn ToolDispatcher>) -> Self {
        self.parent_defs = parent.definitions();
        self.parent = Some(parent);
        self
    }

    pub fn with_local(mut self, tools: Vec<LocalTool>) -> Self {
        for tool in tools {
            match self.local_index.get(tool.name()) {
                Some(&idx) => self.local[idx] = tool,
                None => {
                    self.local_index.insert(tool.name().to_owned(), self.local.len());
                    self.local.push(tool);
                }
            }
        }
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackHandler) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_respond_schema(mut self, schema: Option<Value>) -> Self {
        self.respond_schema = schema;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn resolve(&self, name: &str) -> Route {
        if let Some(t) = TerminalTool::from_name(name) {
            return Route::Terminal(t);
        }
        if let Some(b) = BuiltinTool::from_name(name) {
            return Route::BuiltIn(b);
        }
        if self.parent.is_some() && self.parent_defs.iter().any(|d| d.name == name) {
            return Route::Parent;
        }
        let local = self.local_index.get(name).map(|&i| &self.local[i]);
        if local.is_some_and(|t| t.handler.is_some()) {
            return Route::Local;
        }
        if self.fallback.is_some() {
            return Route::Fallback;
        }
        if local.is_some() {
            Route::Unhandled
        } else {
            Route::Unknown
        }
    }

    /// Every tool offered to the model: terminal, built-in, parent, local.
    /// Names already taken by a higher tier are not offered twice.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![respond_definition(self.respond_schema.as_ref()), reshape_definition()];
        defs.extend(BuiltinTool::definitions());
        for def in self.parent_defs.iter().chain(self.local.iter().map(|t| &t.definition)) {
            if !defs.iter().any(|d| d.name == def.name) {
                defs.push(def.clone());
            }
        }
        defs
    }

    /// Names of the domain tools (parent and local), in declaration order.
    /// Names shadowed by a terminal or built-in tool are left out.
    pub fn domain_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for def in self.parent_defs.iter().chain(self.local.iter().map(|t| &t.definition)) {
            if matches!(self.resolve(&def.name), Route::Terminal(_) | Route::BuiltIn(_)) {
                continue;
            }
            if !names.contains(&def.name) {
                names.push(def.name.clone());
            }
        }
        names
    }

    /// Run one tool invocation and record it in the transcript, tagged
    /// `tool:<route>`. Terminal tools are acknowledged here; their effect is
    /// applied by the reasoning loop.
    pub async fn dispatch(&self, call: &ToolCall) -> Dispatched {
        let route = self.resolve(&call.name);
        let started = Instant::now();

        let result = match route {
            Route::Terminal(_) => Ok(json!("ok")),
            Route::BuiltIn(tool) => tool.execute(&call.input, &self.builtins),
            Route::Parent => match &self.parent {
                Some(parent) => self.guarded(&call.name, parent.dispatch(call)).await,
                None => Err(ToolError::UnknownTool(call.name.clone())),
            },
            Route::Local => match self.local_index.get(&call.name).and_then(|&i| self.local[i].handler.clone()) {
                Some(handler) => self.guarded(&call.name, handler(call.input.clone())).await,
                None => Err(ToolError::UnknownTool(call.name.clone())),
            },
            Route::Fallback => match &self.fallback {
                Some(fallback) => self.guarded(&call.name, fallback(call.clone())).await,
                None => Err(ToolError::UnknownTool(call.name.clone())),
            },
            Route::Unhandled => {
                warn!(tool = %call.name, "tool has no registered handler");
                Ok(Value::Null)
            }
            Route::Unknown => Err(ToolError::UnknownTool(call.name.clone())),
        };

        if let Err(e) = &result {
            warn!(tool = %call.name, route = route.tag(), error = %e, "tool dispatch failed");
        }

        let entry = TranscriptEntry::new(
            format!("tool:{}", route.tag()),
            json!({ "name": call.name, "input": call.input }),
            vec![call.name.clone()],
        )
        .with_duration(started.elapsed());
        let entry = match &result {
            Ok(v) => entry.with_response(v.clone()),
            Err(e) => entry.with_error(e.to_string()),
        };
        self.transcript.push(entry);

        Dispatched { route, result }
    }

    async fn guarded<F>(&self, name: &str, fut: F) -> Result<Value, ToolError>
    where
        F: std::future::Future<Output = Result<Value, ToolError>>,
    {
        match tokio::time::timeout(self.tool_timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, panic = %msg, "tool panicked during execution");
                Err(ToolError::Panicked(msg))
            }
            Err(_) => {
                warn!(tool = %name, timeout_secs = self.tool_timeout.as_secs(), "tool timed out");
                Err(ToolError::ExecutionFailed(format!(
                    "timed out after {}s",
                    self.tool_timeout.as_secs()
                )))
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_core::ids::ToolUseId;
    use morph_store::{AtomRegistry, MemoryStore, SourceStore};

    fn builtins() -> BuiltinContext {
        let store = Arc::new(MemoryStore::new());
        BuiltinContext {
            atoms: Arc::new(AtomRegistry::new(store.clone())),
            sources: Arc::new(SourceStore::new(store)),
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: ToolUseId::new(),
            name: name.into(),
            input,
        }
    }

    struct Parent;

    #[async_trait]
    impl ToolDispatcher for Parent {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![
                ToolDefinition::untyped("save", "persist the list"),
                ToolDefinition::untyped("read_atom", "shadowed"),
            ]
        }

        async fn dispatch(&self, call: &ToolCall) -> Result<Value, ToolError> {
            Ok(json!({ "parent": call.name }))
        }
    }

    #[tokio::test]
    async fn precedence_order() {
        let transcript = Arc::new(TranscriptLog::new());
        let table = ToolTable::new(builtins(), transcript)
            .with_parent(Arc::new(Parent))
            .with_local(vec![
                LocalTool::with_handler(ToolDefinition::untyped("save", "local save"), |_| async {
                    Ok(json!("local"))
                }),
                LocalTool::with_handler(ToolDefinition::untyped("respond", "shadowed"), |_| async {
                    Ok(json!("local"))
                }),
                LocalTool::with_handler(ToolDefinition::untyped("count", "local only"), |_| async {
                    Ok(json!(3))
                }),
            ]);

        assert_eq!(table.resolve("respond"), Route::Terminal(TerminalTool::Respond));
        assert_eq!(table.resolve("read_atom"), Route::BuiltIn(BuiltinTool::ReadAtom));
        assert_eq!(table.resolve("save"), Route::Parent);
        assert_eq!(table.resolve("count"), Route::Local);
        assert_eq!(table.resolve("nothing"), Route::Unknown);

        let out = table.dispatch(&call("save", json!({}))).await;
        assert_eq!(out.result.unwrap(), json!({"parent": "save"}));
    }

    #[tokio::test]
    async fn declared_without_handler_yields_null() {
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new()))
            .with_local(vec![LocalTool::declared(ToolDefinition::untyped("notify", "x"))]);
        let out = table.dispatch(&call("notify", json!({}))).await;
        assert_eq!(out.route, Route::Unhandled);
        assert_eq!(out.result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn fallback_catches_handlerless_and_unknown() {
        let fallback: FallbackHandler = Arc::new(|call: ToolCall| {
            async move { Ok(json!(format!("fallback:{}", call.name))) }.boxed()
        });
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new()))
            .with_local(vec![LocalTool::declared(ToolDefinition::untyped("notify", "x"))])
            .with_fallback(fallback);

        assert_eq!(table.resolve("notify"), Route::Fallback);
        let out = table.dispatch(&call("anything", json!({}))).await;
        assert_eq!(out.result.unwrap(), json!("fallback:anything"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_error() {
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new())).with_local(vec![
            LocalTool::with_handler(ToolDefinition::untyped("explode", "x"), |_| async {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
        ]);
        let out = table.dispatch(&call("explode", json!({}))).await;
        assert!(matches!(out.result, Err(ToolError::Panicked(ref m)) if m == "kaboom"));
        assert!(out.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new()))
            .with_tool_timeout(Duration::from_millis(50))
            .with_local(vec![LocalTool::with_handler(
                ToolDefinition::untyped("slow", "x"),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(Value::Null)
                },
            )]);
        let out = table.dispatch(&call("slow", json!({}))).await;
        assert!(matches!(out.result, Err(ToolError::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn every_dispatch_is_transcribed_by_route() {
        let transcript = Arc::new(TranscriptLog::new());
        let table = ToolTable::new(builtins(), transcript.clone());
        table.dispatch(&call("respond", json!({"content": "hi"}))).await;
        table.dispatch(&call("list_atoms", json!({}))).await;
        table.dispatch(&call("missing", json!({}))).await;

        assert_eq!(transcript.by_source("tool:terminal").len(), 1);
        assert_eq!(transcript.by_source("tool:builtin").len(), 1);
        let unknown = transcript.by_source("tool:unknown");
        assert_eq!(unknown.len(), 1);
        assert!(unknown[0].is_error());
    }

    #[test]
    fn definitions_are_deduplicated_by_precedence() {
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new()))
            .with_parent(Arc::new(Parent))
            .with_local(vec![LocalTool::declared(ToolDefinition::untyped("save", "dup"))]);
        let defs = table.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names[0], "respond");
        assert_eq!(names[1], "reshape");
        assert_eq!(names.iter().filter(|n| **n == "save").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "read_atom").count(), 1);
        assert_eq!(table.domain_tool_names(), vec!["save".to_string()]);
    }

    #[test]
    fn shadowed_names_are_not_domain_tools() {
        let table = ToolTable::new(builtins(), Arc::new(TranscriptLog::new()))
            .with_parent(Arc::new(Parent))
            .with_local(vec![
                LocalTool::declared(ToolDefinition::untyped("respond", "shadowed by the terminal tool")),
                LocalTool::declared(ToolDefinition::untyped("archive", "move to archive")),
            ]);
        assert_eq!(table.resolve("read_atom"), Route::BuiltIn(BuiltinTool::ReadAtom));
        assert_eq!(
            table.domain_tool_names(),
            vec!["save".to_string(), "archive".to_string()]
        );
    }
}
