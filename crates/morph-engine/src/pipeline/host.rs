//! Lua module host.
//!
//! Each install gets a fresh Lua state. The previous state is dropped
//! before the new bundle is evaluated, so nothing from a revoked generation
//! can run again.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{DeserializeOptions, Function, Lua, LuaSerdeExt, RegistryKey, SerializeOptions, Table};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use morph_store::AtomRegistry;

use crate::error::{HostError, RenderError};

const TEARDOWN_KEY: &str = "morph.teardown";

/// Name under which the host API is importable from generated code.
pub const RUNTIME_MODULE: &str = "runtime";

struct ComponentFactory {
    render: RegistryKey,
    init_state: Option<RegistryKey>,
}

struct Installed {
    generation: u64,
    lua: Lua,
    components: BTreeMap<String, ComponentFactory>,
}

/// Reference to an installed module generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleHandle {
    pub generation: u64,
    pub components: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderOutput {
    pub view: Value,
    /// New instance state, when the component returned one.
    pub state: Option<Value>,
}

pub struct LuaHost {
    atoms: Arc<AtomRegistry>,
    current: Mutex<Option<Installed>>,
    generation: AtomicU64,
}

impl LuaHost {
    pub fn new(atoms: Arc<AtomRegistry>) -> Self {
        Self {
            atoms,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Drop the installed module. Returns the revoked generation.
    pub fn revoke(&self) -> Option<u64> {
        let old = self.current.lock().take();
        old.map(|installed| {
            info!(generation = installed.generation, "module revoked");
            installed.generation
        })
    }

    /// Revoke the current module, then evaluate `bundle` in a fresh state.
    pub fn install(&self, bundle: &str) -> Result<ModuleHandle, HostError> {
        self.revoke();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let installed = self.evaluate(bundle, &format!("bundle#{generation}"), generation)?;

        let handle = ModuleHandle {
            generation,
            components: installed.components.keys().cloned().collect(),
        };
        info!(generation, components = handle.components.len(), "module installed");
        *self.current.lock() = Some(installed);
        Ok(handle)
    }

    /// Evaluate `bundle` in a scratch state and check every component it
    /// exports, leaving the installed module untouched. Returns the ids.
    pub fn validate(&self, bundle: &str) -> Result<Vec<String>, HostError> {
        let scratch = self.evaluate(bundle, "candidate", 0)?;
        Ok(scratch.components.into_keys().collect())
    }

    fn evaluate(&self, bundle: &str, name: &str, generation: u64) -> Result<Installed, HostError> {
        let lua = Lua::new();
        lua.set_named_registry_value(TEARDOWN_KEY, lua.create_table()?)?;
        let externals = lua.create_table()?;
        externals.set(RUNTIME_MODULE, runtime_module(&lua, Arc::clone(&self.atoms))?)?;

        let chunk = lua.load(bundle).set_name(name).into_function()?;
        let exports = match chunk.call::<mlua::Value>(externals)? {
            mlua::Value::Table(t) => t,
            other => {
                return Err(HostError::InvalidModule(format!(
                    "entry returned {} instead of a table",
                    other.type_name()
                )))
            }
        };
        let registry: Table = match exports.get::<mlua::Value>("components")? {
            mlua::Value::Table(t) => t,
            _ => return Err(HostError::InvalidModule("entry has no components table".into())),
        };

        let mut components = BTreeMap::new();
        for pair in registry.pairs::<String, mlua::Value>() {
            let (id, module) = pair?;
            let mlua::Value::Table(module) = module else {
                return Err(HostError::InvalidComponent {
                    id,
                    detail: "module must return a table".into(),
                });
            };
            let render = match module.get::<Option<Function>>("render")? {
                Some(f) => lua.create_registry_value(f)?,
                None => {
                    return Err(HostError::InvalidComponent {
                        id,
                        detail: "missing render function".into(),
                    })
                }
            };
            let init_state = module
                .get::<Option<Function>>("init_state")?
                .map(|f| lua.create_registry_value(f))
                .transpose()?;
            components.insert(id, ComponentFactory { render, init_state });
        }

        Ok(Installed {
            generation,
            lua,
            components,
        })
    }

    /// Compile `source` in a scratch state without running it.
    pub fn check_syntax(name: &str, source: &str) -> Result<(), HostError> {
        let lua = Lua::new();
        lua.load(source).set_name(name).into_function()?;
        Ok(())
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|i| i.generation)
    }

    /// Fails with `Revoked` when `handle` is no longer the installed module.
    pub fn check_live(&self, handle: &ModuleHandle) -> Result<(), RenderError> {
        match self.current_generation() {
            Some(g) if g == handle.generation => Ok(()),
            _ => Err(RenderError::Revoked(handle.generation)),
        }
    }

    pub fn has_component(&self, id: &str) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|i| i.components.contains_key(id))
    }

    pub fn components(&self) -> Vec<String> {
        self.current
            .lock()
            .as_ref()
            .map(|i| i.components.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn render(&self, id: &str, props: &Value, state: &Value) -> Result<RenderOutput, RenderError> {
        let guard = self.current.lock();
        let installed = guard.as_ref().ok_or(RenderError::NotLoaded)?;
        let factory = installed
            .components
            .get(id)
            .ok_or_else(|| RenderError::UnknownComponent(id.to_owned()))?;
        let lua = &installed.lua;

        let result = (|| -> mlua::Result<RenderOutput> {
            let render: Function = lua.registry_value(&factory.render)?;
            let (view, next): (mlua::Value, mlua::Value) =
                render.call((to_lua(lua, props)?, to_lua(lua, state)?))?;
            let state = match next {
                mlua::Value::Nil => None,
                v => Some(from_lua(lua, v)?),
            };
            Ok(RenderOutput {
                view: from_lua(lua, view)?,
                state,
            })
        })();
        result.map_err(|e| RenderError::Crashed(e.to_string()))
    }

    /// Initial state for an instance; `{}` when the component has no
    /// `init_state`.
    pub fn initial_state(&self, id: &str, props: &Value) -> Result<Value, RenderError> {
        let guard = self.current.lock();
        let installed = guard.as_ref().ok_or(RenderError::NotLoaded)?;
        let factory = installed
            .components
            .get(id)
            .ok_or_else(|| RenderError::UnknownComponent(id.to_owned()))?;
        let Some(key) = &factory.init_state else {
            return Ok(Value::Object(Default::default()));
        };
        let lua = &installed.lua;

        let result = (|| -> mlua::Result<Value> {
            let init: Function = lua.registry_value(key)?;
            let state: mlua::Value = init.call(to_lua(lua, props)?)?;
            from_lua(lua, state)
        })();
        result.map_err(|e| RenderError::Crashed(e.to_string()))
    }

    /// Invoke and discard every teardown handler registered by the installed
    /// module. Failures are logged and never propagate.
    pub fn run_teardowns(&self) -> usize {
        let guard = self.current.lock();
        let Some(installed) = guard.as_ref() else {
            return 0;
        };
        let lua = &installed.lua;

        let handlers: Vec<Function> = match lua.named_registry_value::<Table>(TEARDOWN_KEY) {
            Ok(table) => table.sequence_values::<Function>().filter_map(Result::ok).collect(),
            Err(e) => {
                warn!(error = %e, "teardown table unavailable");
                return 0;
            }
        };
        match lua.create_table() {
            Ok(fresh) => {
                if let Err(e) = lua.set_named_registry_value(TEARDOWN_KEY, fresh) {
                    warn!(error = %e, "failed to reset teardown table");
                }
            }
            Err(e) => warn!(error = %e, "failed to reset teardown table"),
        }

        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler.call::<()>(()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(index, error = %e, "teardown handler failed"),
                Err(_) => error!(index, "teardown handler panicked"),
            }
        }
        handlers.len()
    }
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

fn from_lua(lua: &Lua, value: mlua::Value) -> mlua::Result<Value> {
    lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
}

/// The `runtime` module: shared atoms, teardown registration and logging.
fn runtime_module(lua: &Lua, atoms: Arc<AtomRegistry>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let reader = Arc::clone(&atoms);
    module.set(
        "atom",
        lua.create_function(move |lua, (key, default): (String, mlua::Value)| {
            let default = from_lua(lua, default)?;
            let value = reader.create(&key, default).get();
            to_lua(lua, &value)
        })?,
    )?;

    let writer = atoms;
    module.set(
        "set_atom",
        lua.create_function(move |lua, (key, value): (String, mlua::Value)| {
            let value = from_lua(lua, value)?;
            Ok(writer.create(&key, Value::Null).set(value))
        })?,
    )?;

    module.set(
        "on_teardown",
        lua.create_function(|lua, handler: Function| {
            let table: Table = lua.named_registry_value(TEARDOWN_KEY)?;
            table.set(table.raw_len() + 1, handler)
        })?,
    )?;

    module.set(
        "log",
        lua.create_function(|_, message: String| {
            info!(target: "morph::lua", "{message}");
            Ok(())
        })?,
    )?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bundler;
    use morph_store::MemoryStore;
    use serde_json::json;

    fn host() -> (LuaHost, Arc<AtomRegistry>) {
        let atoms = Arc::new(AtomRegistry::new(Arc::new(MemoryStore::new())));
        (LuaHost::new(Arc::clone(&atoms)), atoms)
    }

    fn bundle(component: &str) -> String {
        let rows: BTreeMap<String, String> = [
            ("/src/main.lua", "return { components = require('./registry') }"),
            ("/src/registry.lua", "return { ['counter'] = require('./components/counter') }"),
            ("/src/components/counter.lua", component),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        bundler::build("/src/main.lua", &rows).unwrap().text
    }

    const COUNTER: &str = r#"
local runtime = require("runtime")
return {
  init_state = function(props) return { count = 0 } end,
  render = function(props, state)
    local next = { count = state.count + 1 }
    return { label = props.inputs.label, count = next.count }, next
  end,
}
"#;

    #[tokio::test]
    async fn install_and_render() {
        let (host, _) = host();
        let handle = host.install(&bundle(COUNTER)).unwrap();
        assert_eq!(handle.components, vec!["counter".to_string()]);

        let props = json!({"inputs": {"label": "clicks"}});
        let state = host.initial_state("counter", &props).unwrap();
        assert_eq!(state, json!({"count": 0}));

        let out = host.render("counter", &props, &state).unwrap();
        assert_eq!(out.view, json!({"label": "clicks", "count": 1}));
        assert_eq!(out.state, Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn render_error_is_a_crash() {
        let (host, _) = host();
        host.install(&bundle("return { render = function() error('boom') end }"))
            .unwrap();
        let err = host.render("counter", &json!({}), &json!({})).unwrap_err();
        assert!(err.is_crash());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn reinstall_revokes_previous_generation() {
        let (host, _) = host();
        let first = host.install(&bundle(COUNTER)).unwrap();
        let second = host.install(&bundle(COUNTER)).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(host.check_live(&first), Err(RenderError::Revoked(first.generation)));
        assert!(host.check_live(&second).is_ok());
    }

    #[tokio::test]
    async fn failed_install_leaves_nothing_loaded() {
        let (host, _) = host();
        host.install(&bundle(COUNTER)).unwrap();
        let err = host.install("return 42").unwrap_err();
        assert!(matches!(err, HostError::InvalidModule(_)));
        assert_eq!(host.render("counter", &json!({}), &json!({})), Err(RenderError::NotLoaded));
    }

    #[tokio::test]
    async fn missing_render_is_rejected() {
        let (host, _) = host();
        let err = host.install(&bundle("return { init_state = function() return {} end }")).unwrap_err();
        assert!(matches!(err, HostError::InvalidComponent { ref id, .. } if id == "counter"));
    }

    #[tokio::test]
    async fn validate_keeps_the_installed_module() {
        let (host, _) = host();
        let live = host.install(&bundle(COUNTER)).unwrap();

        let err = host
            .validate(&bundle("return { init_state = function() return {} end }"))
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidComponent { ref id, .. } if id == "counter"));
        let err = host.validate(&bundle("error('boom at load')")).unwrap_err();
        assert!(matches!(err, HostError::Lua(_)));

        assert_eq!(host.validate(&bundle(COUNTER)).unwrap(), vec!["counter".to_string()]);
        assert!(host.check_live(&live).is_ok());
        let out = host.render("counter", &json!({"inputs": {"label": "x"}}), &json!({"count": 1})).unwrap();
        assert_eq!(out.view, json!({"label": "x", "count": 2}));
    }

    #[tokio::test]
    async fn components_use_shared_atoms() {
        let (host, atoms) = host();
        host.install(&bundle(
            r#"
local runtime = require("runtime")
return {
  render = function(props, state)
    local n = runtime.atom("visits", 0)
    runtime.set_atom("visits", n + 1)
    return { visits = n + 1 }
  end,
}
"#,
        ))
        .unwrap();
        host.render("counter", &json!({}), &json!({})).unwrap();
        let out = host.render("counter", &json!({}), &json!({})).unwrap();
        assert_eq!(out.view, json!({"visits": 2}));
        assert_eq!(out.state, None);
        assert_eq!(atoms.value("visits"), Some(json!(2)));
    }

    #[tokio::test]
    async fn teardowns_run_once_and_errors_are_contained() {
        let (host, atoms) = host();
        host.install(&bundle(
            r#"
local runtime = require("runtime")
runtime.on_teardown(function() runtime.set_atom("torn", true) end)
runtime.on_teardown(function() error("teardown failed") end)
return { render = function() return {} end }
"#,
        ))
        .unwrap();

        assert_eq!(host.run_teardowns(), 2);
        assert_eq!(atoms.value("torn"), Some(json!(true)));
        assert_eq!(host.run_teardowns(), 0);
    }

    #[test]
    fn syntax_check_does_not_execute() {
        assert!(LuaHost::check_syntax("ok", "error('never runs') return {}").is_ok());
        assert!(matches!(
            LuaHost::check_syntax("bad", "return {"),
            Err(HostError::Lua(_))
        ));
    }

    #[tokio::test]
    async fn unknown_external_fails_install() {
        let (host, _) = host();
        let err = host.install(&bundle("local x = require('react')\nreturn { render = function() end }"));
        assert!(matches!(err, Err(HostError::Lua(_))));
    }
}
