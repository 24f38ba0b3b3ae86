use std::sync::Arc;

use serde_json::{json, Map, Value};

use morph_core::status::{MutationOutcome, PipelineStatus, UnitState};
use morph_engine::pipeline::{ENTRY_PATH, REGISTRY_PATH};
use morph_engine::{Runtime, RuntimeConfig, UnitController, UnitSpec, DELIVER_TOOL};
use morph_llm::{ScriptedBackend, ScriptedResponse, TranscriptLog, Transport};
use morph_store::{Database, DurableStore, MemoryStore, SqliteStore};

const S1: &str = r#"return {
  render = function(props) return { objective = props.inputs.objective, version = 1 } end,
}"#;

const S2: &str = r#"return {
  render = function(props) return { objective = props.inputs.objective, version = 2 } end,
}"#;

fn deliver(source: &str) -> ScriptedResponse {
    ScriptedResponse::tool_use(DELIVER_TOOL, json!({ "source": source }))
}

fn objective(text: &str) -> Map<String, Value> {
    let mut inputs = Map::new();
    inputs.insert("objective".into(), json!(text));
    inputs
}

fn transport(backend: &Arc<ScriptedBackend>) -> Arc<Transport> {
    Arc::new(Transport::new(backend.clone(), Arc::new(TranscriptLog::new()), "test-model", 2048))
}

#[tokio::test]
async fn shape_change_reauthors_exactly_once() {
    let backend = Arc::new(ScriptedBackend::new(vec![deliver(S1), deliver(S2)]));
    let rt = Runtime::new(Arc::new(MemoryStore::new()), transport(&backend), RuntimeConfig::default());
    assert_eq!(rt.start().await.unwrap(), PipelineStatus::Running);
    assert_eq!(rt.sources().list(), vec![ENTRY_PATH.to_string(), REGISTRY_PATH.to_string()]);

    let unit = UnitController::mount(&rt, UnitSpec::new("planner").inputs(objective(""))).unwrap();
    assert_eq!(unit.sync().await.unwrap(), UnitState::Ready);
    assert_eq!(backend.call_count(), 1);
    assert_eq!(unit.render().await.unwrap(), json!({"objective": "", "version": 1}));

    // Identical inputs: same shape, no model call.
    assert_eq!(unit.update_inputs(objective("")).await.unwrap(), UnitState::Ready);
    unit.render().await.unwrap();
    assert_eq!(backend.call_count(), 1);

    // Empty to non-empty string is a shape change.
    assert_eq!(unit.update_inputs(objective("x")).await.unwrap(), UnitState::Ready);
    assert_eq!(backend.call_count(), 2);
    assert_eq!(unit.render().await.unwrap(), json!({"objective": "x", "version": 2}));

    let records = rt.mutations().for_component(unit.id());
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].trigger, "shape-change");
    assert_eq!(records[1].outcome, MutationOutcome::Swap);
    assert_eq!(records[1].previous_source, S1);
    assert_eq!(records[1].new_source, S2);

    let requests = backend.requests();
    assert!(requests[0].system.contains("objective: string:empty"));
    assert!(requests[1].system.contains("objective: string"));
    assert!(!requests[1].system.contains("string:empty"));
    assert!(requests[1].system.contains(S1));

    // Same kind, different text: still no model call.
    unit.update_inputs(objective("y")).await.unwrap();
    assert_eq!(backend.call_count(), 2);
    assert_eq!(rt.transport().transcript().by_source("authoring:planner").len(), 2);
}

#[tokio::test]
async fn authored_source_survives_a_restart() {
    let db = Database::in_memory().unwrap();
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::new(db));

    let backend = Arc::new(ScriptedBackend::new(vec![deliver(S1)]));
    let first = Runtime::new(store.clone(), transport(&backend), RuntimeConfig::default());
    first.start().await.unwrap();
    let unit = UnitController::mount(&first, UnitSpec::new("planner").inputs(objective(""))).unwrap();
    unit.sync().await.unwrap();
    drop(unit);

    let idle = Arc::new(ScriptedBackend::new(vec![]));
    let second = Runtime::new(store, transport(&idle), RuntimeConfig::default());
    second.start().await.unwrap();
    assert!(second.host().has_component("planner"));

    let unit = UnitController::mount(&second, UnitSpec::new("planner").inputs(objective("")))
        .unwrap();
    assert_eq!(unit.sync().await.unwrap(), UnitState::Ready);
    assert_eq!(idle.call_count(), 0);
    assert_eq!(unit.render().await.unwrap(), json!({"objective": "", "version": 1}));
}

#[tokio::test]
async fn atoms_outlive_regeneration() {
    const WRITER: &str = r#"local rt = require("runtime")
return {
  render = function(props)
    rt.set_atom("last_objective", props.inputs.objective)
    return rt.atom("last_objective", "")
  end,
}"#;
    const READER: &str = r#"local rt = require("runtime")
return {
  render = function() return "remembered " .. rt.atom("last_objective", "") end,
}"#;
    let backend = Arc::new(ScriptedBackend::new(vec![deliver(WRITER), deliver(READER)]));
    let rt = Runtime::new(Arc::new(MemoryStore::new()), transport(&backend), RuntimeConfig::default());
    rt.start().await.unwrap();

    let unit = UnitController::mount(&rt, UnitSpec::new("memo").inputs(objective("ship it"))).unwrap();
    unit.sync().await.unwrap();
    assert_eq!(unit.render().await.unwrap(), json!("ship it"));

    unit.reshape("read only").await.unwrap();
    assert_eq!(unit.render().await.unwrap(), json!("remembered ship it"));
    assert_eq!(rt.atoms().value("last_objective"), Some(json!("ship it")));
}

#[tokio::test]
async fn unloadable_unit_leaves_siblings_running() {
    const NO_RENDER: &str = "return { init_state = function() return {} end }";
    const GOOD: &str = r#"return { render = function(props) return "ok:" .. props.inputs.objective end }"#;
    let backend = Arc::new(ScriptedBackend::new(vec![deliver(GOOD), deliver(NO_RENDER), deliver(GOOD)]));
    let store = Arc::new(MemoryStore::new());
    let rt = Runtime::new(store.clone(), transport(&backend), RuntimeConfig::default());
    rt.start().await.unwrap();

    let a = UnitController::mount(&rt, UnitSpec::new("a").inputs(objective("first"))).unwrap();
    assert_eq!(a.sync().await.unwrap(), UnitState::Ready);
    assert_eq!(a.render().await.unwrap(), json!("ok:first"));

    let b = UnitController::mount(&rt, UnitSpec::new("b").inputs(objective("second"))).unwrap();
    assert!(b.sync().await.is_err());
    assert_eq!(b.state(), UnitState::Error);
    assert!(!rt.sources().contains("/src/components/b.lua"));
    assert!(store.value("/src/components/b.lua").is_none());
    assert_eq!(rt.pipeline().status(), PipelineStatus::Running);

    assert_eq!(a.render().await.unwrap(), json!("ok:first"));

    let c = UnitController::mount(&rt, UnitSpec::new("c").inputs(objective("third"))).unwrap();
    assert_eq!(c.sync().await.unwrap(), UnitState::Ready);
    assert_eq!(c.render().await.unwrap(), json!("ok:third"));
    assert_eq!(a.render().await.unwrap(), json!("ok:first"));
    assert_eq!(backend.call_count(), 3);
}
