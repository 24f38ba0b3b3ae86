//! Process-wide services, constructed once and handed to every unit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use morph_core::events::RuntimeEvent;
use morph_core::ids::ComponentId;
use morph_core::status::{Latency, MutationOutcome, PipelineStatus};
use morph_llm::Transport;
use morph_settings::RuntimeSettings;
use morph_store::{AtomRegistry, DurableStore, SourceStore};

use crate::error::EngineError;
use crate::mutations::{MutationLog, MutationRecord};
use crate::pipeline::{generate_registry, InstanceTable, LuaHost, ModuleHandle, Pipeline, ENTRY_PATH, REGISTRY_PATH, SEED_MAIN};
use crate::queue::AuthoringQueue;
use crate::reasoning::{DEFAULT_MAX_TURNS, DEFAULT_VALUE_CEILING};
use crate::tools::builtin::{component_id_of, component_ids};
use crate::tools::BuiltinContext;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub max_turns: u32,
    pub immediate_delay: Duration,
    pub normal_delay: Duration,
    pub background_delay: Duration,
    pub value_ceiling: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            immediate_delay: Latency::Immediate.default_delay(),
            normal_delay: Latency::Normal.default_delay(),
            background_delay: Latency::Background.default_delay(),
            value_ceiling: DEFAULT_VALUE_CEILING,
        }
    }
}

impl RuntimeConfig {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            max_turns: settings.max_turns.max(1),
            immediate_delay: Duration::from_millis(settings.immediate_delay_ms),
            normal_delay: Duration::from_millis(settings.normal_delay_ms),
            background_delay: Duration::from_millis(settings.background_delay_ms),
            value_ceiling: settings.value_ceiling_bytes,
        }
    }

    pub fn delay_for(&self, latency: Latency) -> Duration {
        match latency {
            Latency::Immediate => self.immediate_delay,
            Latency::Normal => self.normal_delay,
            Latency::Background => self.background_delay,
        }
    }
}

pub struct Runtime {
    sources: Arc<SourceStore>,
    atoms: Arc<AtomRegistry>,
    transport: Arc<Transport>,
    mutations: MutationLog,
    host: Arc<LuaHost>,
    instances: Arc<InstanceTable>,
    pipeline: Pipeline,
    queue: AuthoringQueue,
    events: broadcast::Sender<RuntimeEvent>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Wire up the services over one durable store. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Arc<dyn DurableStore>, transport: Arc<Transport>, config: RuntimeConfig) -> Arc<Self> {
        let sources = Arc::new(SourceStore::new(Arc::clone(&store)));
        let atoms = Arc::new(AtomRegistry::new(store));
        let host = Arc::new(LuaHost::new(Arc::clone(&atoms)));
        let instances = Arc::new(InstanceTable::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pipeline = Pipeline::new(Arc::clone(&sources), Arc::clone(&host))
            .with_reconciler(instances.clone())
            .with_events(events.clone());

        Arc::new(Self {
            sources,
            atoms,
            transport,
            mutations: MutationLog::new(),
            host,
            instances,
            pipeline,
            queue: AuthoringQueue::new(),
            events,
            config,
        })
    }

    pub fn sources(&self) -> &Arc<SourceStore> {
        &self.sources
    }

    pub fn atoms(&self) -> &Arc<AtomRegistry> {
        &self.atoms
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn mutations(&self) -> &MutationLog {
        &self.mutations
    }

    pub fn host(&self) -> &Arc<LuaHost> {
        &self.host
    }

    pub fn instances(&self) -> &Arc<InstanceTable> {
        &self.instances
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn queue(&self) -> &AuthoringQueue {
        &self.queue
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn builtin_context(&self) -> BuiltinContext {
        BuiltinContext {
            atoms: Arc::clone(&self.atoms),
            sources: Arc::clone(&self.sources),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<RuntimeEvent> {
        &self.events
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// Every authored unit other than `id`.
    pub fn sibling_ids(&self, id: &ComponentId) -> Vec<String> {
        component_ids(&self.sources)
            .into_iter()
            .filter(|s| s != id.as_str())
            .collect()
    }

    /// Hydrate from durable storage, seed an empty tree and run the first
    /// build. A failed build is reported through the pipeline status.
    #[instrument(skip_all)]
    pub async fn start(self: &Arc<Self>) -> Result<PipelineStatus, EngineError> {
        let rows = self.sources.hydrate().await?;
        let atoms = self.atoms.hydrate().await?;
        info!(sources = rows, atoms, "runtime hydrated");

        let rt = Arc::clone(self);
        self.queue.enqueue(async move { rt.seed().await }).await?;
        if let Err(e) = self.rebuild("startup").await {
            warn!(error = %e, "startup build failed");
        }
        Ok(self.pipeline.status())
    }

    /// Wipe durable storage and history, then re-seed and rebuild.
    #[instrument(skip_all)]
    pub async fn reset(self: &Arc<Self>) -> Result<PipelineStatus, EngineError> {
        let rt = Arc::clone(self);
        self.queue
            .enqueue(async move {
                rt.sources.clear().await?;
                rt.mutations.clear();
                rt.instances.clear();
                rt.host.revoke();
                rt.seed().await;
                Ok::<_, EngineError>(())
            })
            .await??;
        info!("runtime reset");
        if let Err(e) = self.rebuild("reset").await {
            warn!(error = %e, "post-reset build failed");
        }
        Ok(self.pipeline.status())
    }

    async fn seed(&self) {
        if !self.sources.contains(ENTRY_PATH) {
            self.sources.set(ENTRY_PATH, SEED_MAIN).await;
        }
        self.regenerate_registry().await;
    }

    /// Rewrite the registry module from the component sources present.
    pub async fn regenerate_registry(&self) {
        let ids = component_ids(&self.sources);
        let registry = generate_registry(&ids);
        if self.sources.get(REGISTRY_PATH).as_deref() != Some(registry.as_str()) {
            self.sources.set(REGISTRY_PATH, &registry).await;
        }
    }

    /// Queue a registry regeneration and full rebuild.
    pub async fn rebuild(self: &Arc<Self>, reason: &str) -> Result<ModuleHandle, EngineError> {
        let rt = Arc::clone(self);
        let reason = reason.to_owned();
        let handle = self
            .queue
            .enqueue(async move {
                rt.regenerate_registry().await;
                rt.pipeline.build_and_run(&reason).await
            })
            .await??;
        Ok(handle)
    }

    /// Queue a source write for `id`, a registry regeneration and a full
    /// rebuild. The only path by which authoring touches the source tree.
    ///
    /// The candidate tree is bundled and evaluated in a scratch state first.
    /// A candidate that fails is never written, and the running build stays
    /// installed.
    pub async fn write_and_rebuild(
        self: &Arc<Self>,
        id: &ComponentId,
        source: String,
        reason: &str,
    ) -> Result<ModuleHandle, EngineError> {
        let rt = Arc::clone(self);
        let path = id.source_path();
        let reason = reason.to_owned();
        let handle = self
            .queue
            .enqueue(async move {
                let candidate = rt.candidate_tree(&path, &source);
                if let Err(e) = rt.pipeline.verify(&candidate) {
                    warn!(path = %path, reason = %reason, error = %e, "candidate rejected, keeping the running build");
                    rt.emit(RuntimeEvent::BuildFailed {
                        reason: reason.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                rt.sources.set(&path, &source).await;
                rt.regenerate_registry().await;
                rt.pipeline.build_and_run(&reason).await
            })
            .await??;
        Ok(handle)
    }

    /// The current tree with `path` replaced and the registry regenerated.
    fn candidate_tree(&self, path: &str, source: &str) -> BTreeMap<String, String> {
        let mut tree = self.sources.snapshot();
        tree.insert(path.to_owned(), source.to_owned());
        let ids: Vec<String> = tree.keys().filter_map(|p| component_id_of(p)).map(str::to_owned).collect();
        tree.insert(REGISTRY_PATH.to_owned(), generate_registry(&ids));
        tree
    }

    pub fn record_mutation(
        &self,
        id: &ComponentId,
        trigger: &str,
        previous_source: &str,
        new_source: &str,
        outcome: MutationOutcome,
    ) -> MutationRecord {
        let record = self.mutations.record(id, trigger, previous_source, new_source, outcome);
        info!(component_id = %id, trigger, outcome = %outcome, "mutation recorded");
        self.emit(RuntimeEvent::MutationRecorded {
            mutation_id: record.id.clone(),
            component_id: id.clone(),
            trigger: trigger.to_owned(),
            outcome,
        });
        record
    }
}
