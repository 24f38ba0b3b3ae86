//! Per-unit authoring state machine.
//!
//! `checking -> authoring -> ready`, with `error` reachable from authoring
//! and from render crashes. A unit is re-authored only when it has no
//! source, when its shape changes, or on an explicit reshape. Three
//! consecutive render crashes roll it back to the last known-good source
//! without involving the model.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use morph_core::events::RuntimeEvent;
use morph_core::ids::ComponentId;
use morph_core::status::{Latency, MutationOutcome, UnitState};
use morph_core::tools::ToolDefinition;

use crate::authoring::{author, AuthoringRequest};
use crate::boundary::CrashBoundary;
use crate::dispatch::{FallbackHandler, LocalTool, ToolDispatcher, ToolTable};
use crate::error::{EngineError, RenderError};
use crate::prompt::PromptSource;
use crate::reasoning::{LoopDeps, ReasoningLoop, ReasoningOptions};
use crate::runtime::Runtime;
use crate::shape::fingerprint;

/// How a unit reasons about its inputs.
#[derive(Clone, Debug)]
pub struct ReasoningConfig {
    pub prompt: PromptSource,
    /// Falls back to the runtime default.
    pub max_turns: Option<u32>,
    pub latency: Latency,
    pub stale_while_revalidate: bool,
    pub respond_schema: Option<Value>,
}

impl ReasoningConfig {
    pub fn new(prompt: PromptSource) -> Self {
        Self {
            prompt,
            max_turns: None,
            latency: Latency::Normal,
            stale_while_revalidate: false,
            respond_schema: None,
        }
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub fn respond_schema(mut self, schema: Value) -> Self {
        self.respond_schema = Some(schema);
        self
    }
}

/// Everything a caller declares when mounting a unit.
pub struct UnitSpec {
    pub id: ComponentId,
    pub inputs: Map<String, Value>,
    pub tools: Vec<LocalTool>,
    pub handlers: Vec<String>,
    pub parent: Option<Arc<dyn ToolDispatcher>>,
    pub fallback: Option<FallbackHandler>,
    pub reasoning: Option<ReasoningConfig>,
}

impl UnitSpec {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        Self {
            id: id.into(),
            inputs: Map::new(),
            tools: Vec::new(),
            handlers: Vec::new(),
            parent: None,
            fallback: None,
            reasoning: None,
        }
    }

    pub fn inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn tool(mut self, tool: LocalTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn handler(mut self, name: impl Into<String>) -> Self {
        self.handlers.push(name.into());
        self
    }

    pub fn parent(mut self, parent: Arc<dyn ToolDispatcher>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn fallback(mut self, fallback: FallbackHandler) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn reasoning(mut self, config: ReasoningConfig) -> Self {
        self.reasoning = Some(config);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Failure {
    /// Authoring (or the rebuild after it) failed for this shape.
    Authoring { shape: String },
    Crash { error: String },
}

pub struct UnitController {
    runtime: Arc<Runtime>,
    id: ComponentId,
    inputs: Mutex<Map<String, Value>>,
    tool_defs: Vec<ToolDefinition>,
    handlers: Vec<String>,
    shape: Mutex<Option<String>>,
    state: watch::Sender<UnitState>,
    failure: Mutex<Option<Failure>>,
    boundary: CrashBoundary,
    reasoning: Option<ReasoningLoop>,
    authoring: tokio::sync::Mutex<()>,
}

impl UnitController {
    /// Register a unit. Nothing is authored until [`sync`](Self::sync).
    pub fn mount(runtime: &Arc<Runtime>, spec: UnitSpec) -> Result<Arc<Self>, EngineError> {
        if !spec.id.is_valid() {
            return Err(EngineError::InvalidComponentId(spec.id.to_string()));
        }

        let mut table = ToolTable::new(runtime.builtin_context(), Arc::clone(runtime.transport().transcript()))
            .with_local(spec.tools);
        if let Some(parent) = spec.parent {
            table = table.with_parent(parent);
        }
        if let Some(fallback) = spec.fallback {
            table = table.with_fallback(fallback);
        }
        let domain = table.domain_tool_names();
        let tool_defs: Vec<ToolDefinition> = table
            .definitions()
            .into_iter()
            .filter(|d| domain.contains(&d.name))
            .collect();

        let reasoning = spec.reasoning.map(|config| {
            let settings = runtime.config();
            let options = ReasoningOptions::new(spec.id.clone(), config.prompt)
                .max_turns(config.max_turns.unwrap_or(settings.max_turns))
                .latency(config.latency)
                .delay(settings.delay_for(config.latency))
                .stale_while_revalidate(config.stale_while_revalidate)
                .value_ceiling(settings.value_ceiling);
            ReasoningLoop::new(
                LoopDeps {
                    transport: Arc::clone(runtime.transport()),
                    tools: table.with_respond_schema(config.respond_schema),
                    context: runtime.builtin_context(),
                    events: Some(runtime.events().clone()),
                },
                options,
            )
        });

        let (state, _) = watch::channel(UnitState::Checking);
        let unit = Arc::new_cyclic(|weak: &Weak<Self>| {
            if let Some(reasoning) = &reasoning {
                let weak = weak.clone();
                reasoning.on_reshape(Arc::new(move |reason: String| {
                    let Some(unit) = weak.upgrade() else { return };
                    tokio::spawn(async move {
                        if let Err(e) = unit.reshape(&reason).await {
                            warn!(component_id = %unit.id, error = %e, "reshape failed");
                        }
                    });
                }));
            }
            Self {
                runtime: Arc::clone(runtime),
                id: spec.id,
                inputs: Mutex::new(spec.inputs),
                tool_defs,
                handlers: spec.handlers,
                shape: Mutex::new(None),
                state,
                failure: Mutex::new(None),
                boundary: CrashBoundary::default(),
                reasoning,
                authoring: tokio::sync::Mutex::new(()),
            }
        });
        debug!(component_id = %unit.id, "unit mounted");
        Ok(unit)
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UnitState> {
        self.state.subscribe()
    }

    pub fn reasoning(&self) -> Option<&ReasoningLoop> {
        self.reasoning.as_ref()
    }

    pub fn consecutive_crashes(&self) -> u32 {
        self.boundary.consecutive()
    }

    /// Cached shape fingerprint, if the unit has a compiled version.
    pub fn shape(&self) -> Option<String> {
        self.shape.lock().clone()
    }

    pub fn inputs(&self) -> Map<String, Value> {
        self.inputs.lock().clone()
    }

    fn fingerprint(&self) -> String {
        let tools: Vec<String> = self.tool_defs.iter().map(|d| d.name.clone()).collect();
        fingerprint(&self.inputs.lock(), &tools, &self.handlers)
    }

    /// Author, adopt or keep the unit's source according to its shape.
    #[instrument(skip(self), fields(component_id = %self.id))]
    pub async fn sync(&self) -> Result<UnitState, EngineError> {
        let current = self.fingerprint();
        let failure = self.failure.lock().clone();
        if let Some(Failure::Authoring { shape }) = failure {
            if shape == current {
                debug!("authoring failed for this shape; waiting for retry");
                return Ok(UnitState::Error);
            }
        }

        let existing = self.runtime.sources().get(&self.id.source_path());
        let cached = self.shape();
        match (existing, cached) {
            (None, _) => {
                self.author_and_install("mount", None, Some(MutationOutcome::Swap)).await?;
            }
            (Some(_), None) => self.adopt(current).await,
            (Some(_), Some(cached)) if cached == current => {}
            (Some(_), Some(_)) => {
                info!("shape changed");
                self.set_state(UnitState::Checking, Some("shape-change".into()));
                self.author_and_install("shape-change", None, Some(MutationOutcome::Swap))
                    .await?;
            }
        }
        self.notify_reasoning();
        Ok(self.state())
    }

    pub async fn update_inputs(&self, inputs: Map<String, Value>) -> Result<UnitState, EngineError> {
        *self.inputs.lock() = inputs;
        self.sync().await
    }

    /// Source already exists (from a previous session): take it as is.
    async fn adopt(&self, shape: String) {
        *self.shape.lock() = Some(shape);
        if !self.runtime.host().has_component(self.id.as_str()) {
            if let Err(e) = self.runtime.rebuild("adopt").await {
                warn!(component_id = %self.id, error = %e, "rebuild for adopted unit failed");
            }
        }
        if self.state() != UnitState::Error {
            self.set_state(UnitState::Ready, None);
        }
    }

    /// Discard the cached shape and regenerate the unit.
    #[instrument(skip(self), fields(component_id = %self.id))]
    pub async fn reshape(&self, reason: &str) -> Result<UnitState, EngineError> {
        info!(reason, "reshape requested");
        *self.shape.lock() = None;
        let trigger = format!("reshape:{reason}");
        let current = self.runtime.sources().get(&self.id.source_path()).unwrap_or_default();
        self.runtime
            .record_mutation(&self.id, &trigger, &current, "", MutationOutcome::Swap);
        self.set_state(UnitState::Checking, Some(trigger.clone()));
        self.author_and_install(&trigger, Some(reason), None).await?;
        Ok(self.state())
    }

    async fn author_and_install(
        &self,
        trigger: &str,
        reason: Option<&str>,
        outcome: Option<MutationOutcome>,
    ) -> Result<(), EngineError> {
        let _authoring = self.authoring.lock().await;
        self.set_state(UnitState::Authoring, Some(trigger.to_owned()));

        let shape = self.fingerprint();
        let existing = self.runtime.sources().get(&self.id.source_path());
        let inputs = self.inputs();
        let request = AuthoringRequest {
            component_id: &self.id,
            inputs: &inputs,
            tools: &self.tool_defs,
            handlers: &self.handlers,
            existing_source: existing.as_deref(),
            reason,
        };

        let source = match author(self.runtime.transport(), &request).await {
            Ok(source) => source,
            Err(e) => {
                self.fail(Failure::Authoring { shape }, e.to_string());
                return Err(e.into());
            }
        };

        if let Some(outcome) = outcome {
            self.runtime.record_mutation(
                &self.id,
                trigger,
                existing.as_deref().unwrap_or_default(),
                &source,
                outcome,
            );
        }
        if let Err(e) = self.runtime.write_and_rebuild(&self.id, source, trigger).await {
            self.fail(Failure::Authoring { shape }, e.to_string());
            return Err(e);
        }

        *self.shape.lock() = Some(shape);
        *self.failure.lock() = None;
        self.boundary.record_success();
        self.set_state(UnitState::Ready, None);
        info!(component_id = %self.id, trigger, "unit ready");
        Ok(())
    }

    /// Props handed to the component's `render`.
    pub fn props(&self) -> Value {
        let reasoning = self
            .reasoning
            .as_ref()
            .map(|r| serde_json::to_value(r.snapshot()).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        json!({
            "inputs": self.inputs(),
            "handlers": self.handlers,
            "reasoning": reasoning,
        })
    }

    /// Render inside the crash boundary. A crash is returned to the caller
    /// after the boundary has handled it (including any rollback).
    pub async fn render(&self) -> Result<Value, EngineError> {
        let props = self.props();
        let host = self.runtime.host();
        let instances = self.runtime.instances();

        let result = instances
            .ensure(&self.id, &props, host)
            .and_then(|state| host.render(self.id.as_str(), &props, &state));
        match result {
            Ok(output) => {
                if let Some(state) = output.state {
                    instances.set_state(&self.id, state);
                }
                self.boundary.record_success();
                if matches!(*self.failure.lock(), Some(Failure::Crash { .. })) {
                    *self.failure.lock() = None;
                }
                if self.state() == UnitState::Error && self.failure.lock().is_none() {
                    self.set_state(UnitState::Ready, None);
                }
                Ok(output.view)
            }
            Err(e) if e.is_crash() => {
                self.handle_crash(&e).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_crash(&self, e: &RenderError) {
        let consecutive = self.boundary.record_crash();
        error!(component_id = %self.id, consecutive, error = %e, "unit render crashed");
        self.runtime.emit(RuntimeEvent::UnitCrashed {
            component_id: self.id.clone(),
            consecutive,
            error: e.to_string(),
        });
        self.fail(Failure::Crash { error: e.to_string() }, e.to_string());

        if self.boundary.should_roll_back() {
            match self.roll_back().await {
                Ok(true) => {}
                Ok(false) => warn!(component_id = %self.id, "no known-good source; waiting for manual retry"),
                Err(err) => error!(component_id = %self.id, error = %err, "rollback failed"),
            }
        }
    }

    /// Restore the last known-good source. Returns `false` when there is
    /// nothing to roll back to.
    async fn roll_back(&self) -> Result<bool, EngineError> {
        let current = self.runtime.sources().get(&self.id.source_path());
        let Some(target) = self
            .runtime
            .mutations()
            .last_known_good(&self.id, current.as_deref())
        else {
            return Ok(false);
        };

        let record = self.runtime.record_mutation(
            &self.id,
            "crash-rollback",
            current.as_deref().unwrap_or_default(),
            &target.previous_source,
            MutationOutcome::Rollback,
        );
        self.runtime
            .write_and_rebuild(&self.id, target.previous_source, "rollback")
            .await?;

        self.runtime.instances().unmount(&self.id);
        self.boundary.record_success();
        *self.failure.lock() = None;
        self.set_state(UnitState::Ready, Some("rolled back".into()));
        info!(component_id = %self.id, target = %target.id, "unit rolled back");
        self.runtime.emit(RuntimeEvent::UnitRolledBack {
            component_id: self.id.clone(),
            mutation_id: record.id,
        });
        Ok(true)
    }

    /// Manual recovery from `error`: re-author the unit.
    #[instrument(skip(self), fields(component_id = %self.id))]
    pub async fn retry(&self) -> Result<UnitState, EngineError> {
        let failure = self.failure.lock().clone();
        match failure {
            None => {}
            Some(Failure::Crash { error }) => {
                self.runtime.instances().unmount(&self.id);
                let reason = format!("render crashed: {error}");
                self.author_and_install("retry", Some(&reason), Some(MutationOutcome::CrashRecovery))
                    .await?;
            }
            Some(Failure::Authoring { .. }) => {
                self.author_and_install("retry", None, Some(MutationOutcome::Swap))
                    .await?;
            }
        }
        Ok(self.state())
    }

    /// Discard instance state and the reasoning fire budget.
    pub fn remount(&self) {
        let current = self.runtime.sources().get(&self.id.source_path()).unwrap_or_default();
        self.runtime
            .record_mutation(&self.id, "remount", "", &current, MutationOutcome::Remount);
        self.runtime.instances().unmount(&self.id);
        self.boundary.record_success();
        if let Some(reasoning) = &self.reasoning {
            reasoning.reset_fires();
        }
        self.notify_reasoning();
    }

    /// Drop the live instance and pending reasoning. The source stays.
    pub fn unmount(&self) {
        self.runtime.instances().unmount(&self.id);
        if let Some(reasoning) = &self.reasoning {
            reasoning.reset_fires();
        }
        *self.shape.lock() = None;
        debug!(component_id = %self.id, "unit unmounted");
    }

    fn notify_reasoning(&self) {
        let Some(reasoning) = &self.reasoning else { return };
        if self.state() == UnitState::Ready {
            reasoning.notify(Value::Object(self.inputs()));
        }
    }

    fn fail(&self, failure: Failure, detail: String) {
        *self.failure.lock() = Some(failure);
        self.set_state(UnitState::Error, Some(detail));
    }

    fn set_state(&self, state: UnitState, detail: Option<String>) {
        self.state.send_replace(state);
        debug!(component_id = %self.id, state = %state, "unit state changed");
        self.runtime.emit(RuntimeEvent::UnitStateChanged {
            component_id: self.id.clone(),
            state,
            detail,
        });
    }
}
