//! Introspection tools every unit gets: shared atoms and component sources.

use std::sync::Arc;

use serde_json::{json, Value};

use morph_core::ids::ComponentId;
use morph_core::tools::{ToolDefinition, ToolError};
use morph_store::{AtomRegistry, SourceStore};

pub const COMPONENTS_DIR: &str = "/src/components";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinTool {
    ReadAtom,
    WriteAtom,
    ListAtoms,
    ListComponents,
    ReadComponent,
}

pub const ALL_BUILTINS: [BuiltinTool; 5] = [
    BuiltinTool::ReadAtom,
    BuiltinTool::WriteAtom,
    BuiltinTool::ListAtoms,
    BuiltinTool::ListComponents,
    BuiltinTool::ReadComponent,
];

/// Shared services the built-in tools read and write.
#[derive(Clone)]
pub struct BuiltinContext {
    pub atoms: Arc<AtomRegistry>,
    pub sources: Arc<SourceStore>,
}

impl BuiltinTool {
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_BUILTINS.into_iter().find(|t| t.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadAtom => "read_atom",
            Self::WriteAtom => "write_atom",
            Self::ListAtoms => "list_atoms",
            Self::ListComponents => "list_components",
            Self::ReadComponent => "read_component",
        }
    }

    pub fn definition(self) -> ToolDefinition {
        match self {
            Self::ReadAtom => ToolDefinition::new(
                self.name(),
                "Read the current value of a shared atom.",
                json!({
                    "type": "object",
                    "properties": { "key": { "type": "string" } },
                    "required": ["key"]
                }),
            ),
            Self::WriteAtom => ToolDefinition::new(
                self.name(),
                "Set a shared atom. Other units subscribed to it update immediately.",
                json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "value": {}
                    },
                    "required": ["key", "value"]
                }),
            ),
            Self::ListAtoms => ToolDefinition::untyped(self.name(), "List every shared atom with its value."),
            Self::ListComponents => ToolDefinition::untyped(self.name(), "List the ids of all generated components."),
            Self::ReadComponent => ToolDefinition::new(
                self.name(),
                "Read the source of a generated component.",
                json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
            ),
        }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        ALL_BUILTINS.into_iter().map(Self::definition).collect()
    }

    pub fn execute(self, input: &Value, ctx: &BuiltinContext) -> Result<Value, ToolError> {
        match self {
            Self::ReadAtom => {
                let key = ToolError::require_str(input, "key")?;
                Ok(ctx.atoms.value(key).unwrap_or(Value::Null))
            }
            Self::WriteAtom => {
                let key = ToolError::require_str(input, "key")?;
                let value = input
                    .get("value")
                    .cloned()
                    .ok_or_else(|| ToolError::InvalidArguments("missing field: value".into()))?;
                let changed = ctx.atoms.create(key, Value::Null).set(value);
                Ok(json!({ "ok": true, "changed": changed }))
            }
            Self::ListAtoms => Ok(Value::Object(ctx.atoms.snapshot().into_iter().collect())),
            Self::ListComponents => Ok(json!(component_ids(&ctx.sources))),
            Self::ReadComponent => {
                let id = ToolError::require_str(input, "id")?;
                let path = ComponentId::from_raw(id).source_path();
                ctx.sources
                    .get(&path)
                    .map(Value::String)
                    .ok_or_else(|| ToolError::ExecutionFailed(format!("no component named {id}")))
            }
        }
    }
}

/// Ids of every component with a source file, sorted.
pub fn component_ids(sources: &SourceStore) -> Vec<String> {
    sources
        .list_dir(COMPONENTS_DIR)
        .iter()
        .filter_map(|p| component_id_of(p))
        .map(str::to_owned)
        .collect()
}

/// The component id a source path belongs to, if it is a component module.
pub fn component_id_of(path: &str) -> Option<&str> {
    path.strip_prefix(COMPONENTS_DIR)?
        .strip_prefix('/')?
        .strip_suffix(".lua")
        .filter(|name| !name.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_store::MemoryStore;

    fn ctx() -> BuiltinContext {
        let store = Arc::new(MemoryStore::new());
        BuiltinContext {
            atoms: Arc::new(AtomRegistry::new(store.clone())),
            sources: Arc::new(SourceStore::new(store)),
        }
    }

    #[tokio::test]
    async fn write_then_read_atom() {
        let ctx = ctx();
        let out = BuiltinTool::WriteAtom
            .execute(&json!({"key": "theme", "value": "dark"}), &ctx)
            .unwrap();
        assert_eq!(out["changed"], true);

        let value = BuiltinTool::ReadAtom.execute(&json!({"key": "theme"}), &ctx).unwrap();
        assert_eq!(value, json!("dark"));

        let missing = BuiltinTool::ReadAtom.execute(&json!({"key": "nope"}), &ctx).unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[tokio::test]
    async fn list_atoms_returns_object() {
        let ctx = ctx();
        ctx.atoms.create("a", json!(1));
        ctx.atoms.create("b", json!([2]));
        let out = BuiltinTool::ListAtoms.execute(&Value::Null, &ctx).unwrap();
        assert_eq!(out, json!({"a": 1, "b": [2]}));
    }

    #[tokio::test]
    async fn components_are_listed_and_readable() {
        let ctx = ctx();
        ctx.sources.set("/src/components/todo.lua", "return {}").await;
        ctx.sources.set("/src/components/clock.lua", "return {}").await;
        ctx.sources.set("/src/main.lua", "return {}").await;

        let ids = BuiltinTool::ListComponents.execute(&Value::Null, &ctx).unwrap();
        assert_eq!(ids, json!(["clock", "todo"]));

        let src = BuiltinTool::ReadComponent.execute(&json!({"id": "todo"}), &ctx).unwrap();
        assert_eq!(src, json!("return {}"));
        assert!(BuiltinTool::ReadComponent.execute(&json!({"id": "x"}), &ctx).is_err());
    }

    #[test]
    fn missing_arguments_are_rejected() {
        let ctx = ctx();
        assert!(matches!(
            BuiltinTool::WriteAtom.execute(&json!({"key": "k"}), &ctx),
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            BuiltinTool::ReadAtom.execute(&json!({}), &ctx),
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(BuiltinTool::from_name("list_atoms"), Some(BuiltinTool::ListAtoms));
        assert_eq!(BuiltinTool::from_name("respond"), None);
        assert_eq!(BuiltinTool::definitions().len(), 5);
    }
}
