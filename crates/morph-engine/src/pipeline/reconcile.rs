//! Hot-swap reconciliation.
//!
//! Every mounted unit owns one live instance keyed by its component id.
//! After a new module is loaded, an instance keeps its state when the new
//! definition's initial state has the same top-level keys as the current
//! state, and is re-initialised otherwise.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use morph_core::ids::ComponentId;

use super::host::LuaHost;
use crate::error::RenderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    Preserved,
    Remounted,
    Orphaned,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcomes: Vec<(ComponentId, Reconciled)>,
}

impl ReconcileReport {
    pub fn outcome(&self, id: &ComponentId) -> Option<Reconciled> {
        self.outcomes.iter().find(|(i, _)| i == id).map(|(_, o)| *o)
    }

    pub fn count(&self, kind: Reconciled) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == kind).count()
    }
}

/// Brings live instances in line with freshly loaded definitions.
pub trait Reconciler: Send + Sync {
    fn reconcile(&self, host: &LuaHost) -> ReconcileReport;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub props: Value,
    pub state: Value,
}

#[derive(Default)]
pub struct InstanceTable {
    instances: Mutex<HashMap<ComponentId, Instance>>,
}

fn top_level_keys(value: &Value) -> BTreeSet<String> {
    value
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, initialising the instance on first use.
    pub fn ensure(&self, id: &ComponentId, props: &Value, host: &LuaHost) -> Result<Value, RenderError> {
        if let Some(instance) = self.instances.lock().get_mut(id) {
            instance.props = props.clone();
            return Ok(instance.state.clone());
        }
        let state = host.initial_state(id.as_str(), props)?;
        self.instances.lock().insert(
            id.clone(),
            Instance {
                props: props.clone(),
                state: state.clone(),
            },
        );
        Ok(state)
    }

    pub fn get(&self, id: &ComponentId) -> Option<Instance> {
        self.instances.lock().get(id).cloned()
    }

    pub fn set_state(&self, id: &ComponentId, state: Value) {
        if let Some(instance) = self.instances.lock().get_mut(id) {
            instance.state = state;
        }
    }

    /// Forget the instance; the next `ensure` re-initialises it.
    pub fn unmount(&self, id: &ComponentId) -> Option<Instance> {
        self.instances.lock().remove(id)
    }

    pub fn ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.instances.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.instances.lock().clear();
    }
}

impl Reconciler for InstanceTable {
    fn reconcile(&self, host: &LuaHost) -> ReconcileReport {
        let mut instances = self.instances.lock();
        let mut ids: Vec<ComponentId> = instances.keys().cloned().collect();
        ids.sort();

        let mut report = ReconcileReport::default();
        for id in ids {
            let Some(instance) = instances.get_mut(&id) else { continue };
            if !host.has_component(id.as_str()) {
                report.outcomes.push((id, Reconciled::Orphaned));
                continue;
            }
            let fresh = match host.initial_state(id.as_str(), &instance.props) {
                Ok(state) => state,
                Err(e) => {
                    warn!(component_id = %id, error = %e, "init_state failed during reconcile");
                    Value::Object(Map::new())
                }
            };
            let outcome = if top_level_keys(&fresh) == top_level_keys(&instance.state) {
                Reconciled::Preserved
            } else {
                instance.state = fresh;
                Reconciled::Remounted
            };
            debug!(component_id = %id, ?outcome, "instance reconciled");
            report.outcomes.push((id, outcome));
        }
        report
    }
}
