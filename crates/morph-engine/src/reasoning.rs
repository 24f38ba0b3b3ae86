//! Multi-turn tool-calling loop driving one unit's behavior.
//!
//! A run ends on exactly one of three conditions: a `reshape` invocation
//! (after its sibling invocations are dispatched), a turn with no tool
//! invocations, or an exhausted turn budget (the last turn's invocations are
//! dispatched once).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use morph_core::errors::TransportError;
use morph_core::events::RuntimeEvent;
use morph_core::ids::ComponentId;
use morph_core::messages::{ContentBlock, Message};
use morph_core::status::{Latency, ReasoningStatus};
use morph_core::tools::ToolCall;
use morph_llm::{CallExtras, Transport};

use crate::debounce::Debouncer;
use crate::dispatch::ToolTable;
use crate::prompt::{reasoning_system_prompt, PromptContext, PromptSource};
use crate::tools::builtin::component_ids;
use crate::tools::{BuiltinContext, RESHAPE, RESPOND};

/// Dependency-triggered fires allowed per mounted instance.
pub const FIRE_CEILING: u32 = 10;
pub const DEFAULT_MAX_TURNS: u32 = 5;
pub const DEFAULT_VALUE_CEILING: usize = 4000;

pub type ReshapeCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ReasoningOptions {
    pub component_id: ComponentId,
    pub prompt: PromptSource,
    pub max_turns: u32,
    pub latency: Latency,
    pub delay: Duration,
    pub stale_while_revalidate: bool,
    pub value_ceiling: usize,
}

impl ReasoningOptions {
    pub fn new(component_id: ComponentId, prompt: PromptSource) -> Self {
        Self {
            component_id,
            prompt,
            max_turns: DEFAULT_MAX_TURNS,
            latency: Latency::Normal,
            delay: Latency::Normal.default_delay(),
            stale_while_revalidate: false,
            value_ceiling: DEFAULT_VALUE_CEILING,
        }
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Select a latency class with its default debounce delay.
    pub fn latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self.delay = latency.default_delay();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub fn value_ceiling(mut self, ceiling: usize) -> Self {
        self.value_ceiling = ceiling;
        self
    }
}

/// What the unit sees of its reasoning loop.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningSnapshot {
    pub status: ReasoningStatus,
    pub response: Option<Value>,
    pub stale: bool,
    pub status_text: String,
    pub turn: u32,
    pub max_turns: u32,
}

impl ReasoningSnapshot {
    fn idle(max_turns: u32) -> Self {
        Self {
            status: ReasoningStatus::Idle,
            response: None,
            stale: false,
            status_text: String::new(),
            turn: 0,
            max_turns,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed {
        response: Option<Value>,
        turns: u32,
    },
    Reshaped {
        reason: String,
        response: Option<Value>,
        turns: u32,
    },
    Failed(TransportError),
}

impl RunOutcome {
    pub fn response(&self) -> Option<&Value> {
        match self {
            Self::Completed { response, .. } | Self::Reshaped { response, .. } => response.as_ref(),
            Self::Failed(_) => None,
        }
    }

    pub fn turns(&self) -> u32 {
        match self {
            Self::Completed { turns, .. } | Self::Reshaped { turns, .. } => *turns,
            Self::Failed(_) => 0,
        }
    }
}

/// Collaborators a loop needs.
pub struct LoopDeps {
    pub transport: Arc<Transport>,
    pub tools: ToolTable,
    pub context: BuiltinContext,
    pub events: Option<broadcast::Sender<RuntimeEvent>>,
}

#[derive(Default)]
struct Deps {
    latest: Option<Value>,
    last_fired: Option<Value>,
}

struct LoopInner {
    options: ReasoningOptions,
    transport: Arc<Transport>,
    tools: ToolTable,
    context: BuiltinContext,
    events: Option<broadcast::Sender<RuntimeEvent>>,
    state: watch::Sender<ReasoningSnapshot>,
    debouncer: Debouncer,
    fires: AtomicU32,
    deps: Mutex<Deps>,
    on_reshape: Mutex<Option<ReshapeCallback>>,
}

#[derive(Clone)]
pub struct ReasoningLoop {
    inner: Arc<LoopInner>,
}

impl ReasoningLoop {
    pub fn new(deps: LoopDeps, options: ReasoningOptions) -> Self {
        let (state, _) = watch::channel(ReasoningSnapshot::idle(options.max_turns.max(1)));
        let debouncer = Debouncer::new(options.delay);
        Self {
            inner: Arc::new(LoopInner {
                options,
                transport: deps.transport,
                tools: deps.tools,
                context: deps.context,
                events: deps.events,
                state,
                debouncer,
                fires: AtomicU32::new(0),
                deps: Mutex::new(Deps::default()),
                on_reshape: Mutex::new(None),
            }),
        }
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.inner.options.component_id
    }

    pub fn on_reshape(&self, callback: ReshapeCallback) {
        *self.inner.on_reshape.lock() = Some(callback);
    }

    pub fn snapshot(&self) -> ReasoningSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReasoningSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn tools(&self) -> &ToolTable {
        &self.inner.tools
    }

    /// Report the current dependency values. Returns whether a run was
    /// scheduled: unchanged values and values past the fire ceiling are
    /// ignored.
    pub fn notify(&self, deps: Value) -> bool {
        let id = &self.inner.options.component_id;
        if self.inner.fires.load(Ordering::SeqCst) >= FIRE_CEILING {
            debug!(component_id = %id, "fire ceiling reached, ignoring dependency change");
            return false;
        }
        {
            let mut state = self.inner.deps.lock();
            if state.latest.as_ref() == Some(&deps) {
                return false;
            }
            state.latest = Some(deps);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.debouncer.schedule(async move {
            inner.fire().await;
        });
        true
    }

    pub fn fire_count(&self) -> u32 {
        self.inner.fires.load(Ordering::SeqCst)
    }

    /// Drop any pending fire and allow a fresh budget of fires.
    pub fn reset_fires(&self) {
        self.inner.debouncer.cancel();
        self.inner.fires.store(0, Ordering::SeqCst);
        *self.inner.deps.lock() = Deps::default();
    }

    /// One run, bypassing debounce and the fire ceiling.
    pub async fn run_once(&self, previous: Option<Value>, current: Value) -> RunOutcome {
        self.inner.run(previous, current).await
    }
}

impl LoopInner {
    async fn fire(&self) {
        let fired = self.fires.fetch_add(1, Ordering::SeqCst) + 1;
        if fired > FIRE_CEILING {
            return;
        }
        let (previous, current) = {
            let mut deps = self.deps.lock();
            let Some(current) = deps.latest.clone() else { return };
            let previous = deps.last_fired.replace(current.clone());
            (previous, current)
        };
        debug!(component_id = %self.options.component_id, fired, "reasoning fired");
        self.run(previous, current).await;
    }

    #[instrument(skip_all, fields(component_id = %self.options.component_id))]
    async fn run(&self, previous: Option<Value>, current: Value) -> RunOutcome {
        let id = &self.options.component_id;
        let max_turns = self.options.max_turns.max(1);

        let prompt = self.options.prompt.text(previous.as_ref(), &current);
        let tools = self.tools.definitions();
        let own_source = self.context.sources.get(&id.source_path());
        let atoms = self.context.atoms.snapshot();
        let siblings: Vec<String> = component_ids(&self.context.sources)
            .into_iter()
            .filter(|s| s != id.as_str())
            .collect();
        let system = reasoning_system_prompt(&PromptContext {
            component_id: id,
            tools: &tools,
            own_source: own_source.as_deref(),
            atoms: &atoms,
            siblings: &siblings,
            previous: previous.as_ref(),
            current: &current,
            ceiling: self.options.value_ceiling,
        });
        let tag = format!("reasoning:{id}");

        self.begin(max_turns);

        let mut messages = vec![Message::user_text(prompt)];
        let mut latest: Option<Value> = None;
        let mut final_text = String::new();
        let mut turns = 0;

        for turn in 1..=max_turns {
            turns = turn;
            self.update(|s| {
                s.turn = turn;
                s.status_text = format!("thinking (turn {turn} of {max_turns})");
            });

            let response = match self
                .transport
                .call(&tag, &system, &messages, CallExtras::with_tools(tools.clone()))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.fail(&e);
                    return RunOutcome::Failed(e);
                }
            };

            final_text = response.text_content();
            let calls = response.tool_calls();
            if calls.is_empty() {
                break;
            }
            messages.push(response.to_message());

            let mut reshape: Option<&ToolCall> = None;
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                if call.name == RESHAPE {
                    reshape.get_or_insert(call);
                    continue;
                }
                if call.name == RESPOND {
                    latest = Some(call.input.clone());
                    self.update(|s| {
                        s.response = Some(call.input.clone());
                        s.stale = false;
                    });
                } else {
                    self.update(|s| s.status_text = format!("calling {}", call.name));
                }
                let dispatched = self.tools.dispatch(call).await;
                results.push(ContentBlock::tool_result(
                    call.id.clone(),
                    dispatched.content(),
                    dispatched.is_error(),
                ));
            }

            if let Some(call) = reshape {
                self.tools.dispatch(call).await;
                let reason = call
                    .input
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string();
                info!(component_id = %id, turn, reason = %reason, "reasoning requested reshape");
                self.finish(latest.clone(), format!("reshaping: {reason}"));
                let callback = self.on_reshape.lock().clone();
                if let Some(callback) = callback {
                    callback(reason.clone());
                }
                return RunOutcome::Reshaped {
                    reason,
                    response: latest,
                    turns,
                };
            }

            if turn == max_turns {
                debug!(component_id = %id, max_turns, "turn budget exhausted");
                break;
            }
            messages.push(Message::tool_results(results));
        }

        let response = latest.or_else(|| fallback_response(&final_text));
        self.finish(response.clone(), "done".into());
        RunOutcome::Completed { response, turns }
    }

    fn update(&self, f: impl FnOnce(&mut ReasoningSnapshot)) {
        self.state.send_modify(f);
    }

    fn begin(&self, max_turns: u32) {
        let keep = self.options.stale_while_revalidate;
        self.state.send_modify(|s| {
            s.status = ReasoningStatus::Reasoning;
            if !keep {
                s.response = None;
            }
            s.stale = keep && s.response.is_some();
            s.status_text = "thinking".into();
            s.turn = 0;
            s.max_turns = max_turns;
        });
        self.emit();
    }

    fn finish(&self, response: Option<Value>, status_text: String) {
        self.state.send_modify(|s| {
            s.status = ReasoningStatus::Done;
            s.response = response;
            s.stale = false;
            s.status_text = status_text;
        });
        self.emit();
    }

    fn fail(&self, error: &TransportError) {
        warn!(component_id = %self.options.component_id, error = %error, "reasoning run failed");
        let keep = self.options.stale_while_revalidate;
        self.state.send_modify(|s| {
            s.status = ReasoningStatus::Error;
            if !keep {
                s.response = None;
            }
            s.stale = s.response.is_some();
            s.status_text = error.to_string();
        });
        self.emit();
    }

    fn emit(&self) {
        let Some(events) = &self.events else { return };
        let snapshot = self.state.borrow().clone();
        let _ = events.send(RuntimeEvent::ReasoningStatusChanged {
            component_id: self.options.component_id.clone(),
            status: snapshot.status,
            turn: snapshot.turn,
            max_turns: snapshot.max_turns,
        });
    }
}

/// Response for a run that never called `respond`: the final text as a JSON
/// object when it parses as one, otherwise wrapped as `{content}`.
pub fn fallback_response(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => Some(json!({ "content": trimmed })),
    }
}
