//! Compile/load pipeline: bundle the source tree, hot-swap the module,
//! reconcile live instances.

pub mod bundler;
pub mod host;
pub mod reconcile;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument};

use morph_core::events::RuntimeEvent;
use morph_core::status::PipelineStatus;
use morph_store::SourceStore;

use crate::error::PipelineError;

pub use bundler::Bundle;
pub use host::{LuaHost, ModuleHandle, RenderOutput};
pub use reconcile::{InstanceTable, ReconcileReport, Reconciled, Reconciler};
pub use registry::{generate_registry, ENTRY_PATH, REGISTRY_PATH, SEED_MAIN};

pub type ErrorCallback = Arc<dyn Fn(&PipelineError) + Send + Sync>;

pub struct Pipeline {
    sources: Arc<SourceStore>,
    host: Arc<LuaHost>,
    reconciler: Option<Arc<dyn Reconciler>>,
    entry: String,
    status: watch::Sender<PipelineStatus>,
    events: Option<broadcast::Sender<RuntimeEvent>>,
    on_error: Option<ErrorCallback>,
}

impl Pipeline {
    pub fn new(sources: Arc<SourceStore>, host: Arc<LuaHost>) -> Self {
        let (status, _) = watch::channel(PipelineStatus::Idle);
        Self {
            sources,
            host,
            reconciler: None,
            entry: ENTRY_PATH.to_owned(),
            status,
            events: None,
            on_error: None,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    pub fn host(&self) -> &Arc<LuaHost> {
        &self.host
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Bundle everything reachable from `entry` using the current sources.
    pub fn build(&self, entry: &str) -> Result<Bundle, PipelineError> {
        let bundle = bundler::build(entry, &self.sources.snapshot())?;
        debug!(
            entry,
            modules = bundle.modules.len(),
            elapsed_ms = bundle.elapsed.as_millis() as u64,
            "bundle built"
        );
        Ok(bundle)
    }

    /// Bundle `tree` and evaluate it in a scratch state. The installed
    /// module and the pipeline status are left alone.
    pub fn verify(&self, tree: &BTreeMap<String, String>) -> Result<Vec<String>, PipelineError> {
        let bundle = bundler::build(&self.entry, tree)?;
        Ok(self.host.validate(&bundle.text)?)
    }

    /// Install a bundle, revoking the previous module first.
    pub fn load(&self, bundle: &str) -> Result<ModuleHandle, PipelineError> {
        Ok(self.host.install(bundle)?)
    }

    /// Build, tear down, load and reconcile. On failure the status is set to
    /// `Error` and the error callback runs; nothing is retried.
    #[instrument(skip(self), fields(entry = %self.entry))]
    pub async fn build_and_run(&self, reason: &str) -> Result<ModuleHandle, PipelineError> {
        self.set_status(PipelineStatus::Building, reason);

        match self.run_stages(reason).await {
            Ok(handle) => {
                self.set_status(PipelineStatus::Running, reason);
                info!(reason, generation = handle.generation, "build complete");
                Ok(handle)
            }
            Err(e) => {
                self.set_status(PipelineStatus::Error, reason);
                error!(reason, error = %e, "build failed");
                if let Some(events) = &self.events {
                    let _ = events.send(RuntimeEvent::BuildFailed {
                        reason: reason.to_owned(),
                        error: e.to_string(),
                    });
                }
                if let Some(callback) = &self.on_error {
                    callback(&e);
                }
                Err(e)
            }
        }
    }

    async fn run_stages(&self, reason: &str) -> Result<ModuleHandle, PipelineError> {
        let bundle = self.build(&self.entry)?;

        let torn_down = self.host.run_teardowns();
        if torn_down > 0 {
            debug!(torn_down, "teardown handlers invoked");
        }

        self.set_status(PipelineStatus::Importing, reason);
        let handle = self.load(&bundle.text)?;

        if let Some(reconciler) = &self.reconciler {
            tokio::task::yield_now().await;
            let report = reconciler.reconcile(&self.host);
            debug!(
                preserved = report.count(Reconciled::Preserved),
                remounted = report.count(Reconciled::Remounted),
                orphaned = report.count(Reconciled::Orphaned),
                "instances reconciled"
            );
        }
        Ok(handle)
    }

    fn set_status(&self, status: PipelineStatus, reason: &str) {
        self.status.send_replace(status);
        if let Some(events) = &self.events {
            let _ = events.send(RuntimeEvent::PipelineStatusChanged {
                status,
                reason: reason.to_owned(),
            });
        }
    }
}
