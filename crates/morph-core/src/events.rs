use serde::{Deserialize, Serialize};

use crate::ids::{ComponentId, MutationId};
use crate::status::{MutationOutcome, PipelineStatus, ReasoningStatus, UnitState};

/// Runtime lifecycle events, broadcast for observability tooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    PipelineStatusChanged {
        status: PipelineStatus,
        reason: String,
    },
    BuildFailed {
        reason: String,
        error: String,
    },
    UnitStateChanged {
        component_id: ComponentId,
        state: UnitState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    UnitCrashed {
        component_id: ComponentId,
        consecutive: u32,
        error: String,
    },
    UnitRolledBack {
        component_id: ComponentId,
        mutation_id: MutationId,
    },
    MutationRecorded {
        mutation_id: MutationId,
        component_id: ComponentId,
        trigger: String,
        outcome: MutationOutcome,
    },
    ReasoningStatusChanged {
        component_id: ComponentId,
        status: ReasoningStatus,
        turn: u32,
        max_turns: u32,
    },
}

impl RuntimeEvent {
    pub fn component_id(&self) -> Option<&ComponentId> {
        match self {
            Self::UnitStateChanged { component_id, .. }
            | Self::UnitCrashed { component_id, .. }
            | Self::UnitRolledBack { component_id, .. }
            | Self::MutationRecorded { component_id, .. }
            | Self::ReasoningStatusChanged { component_id, .. } => Some(component_id),
            Self::PipelineStatusChanged { .. } | Self::BuildFailed { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineStatusChanged { .. } => "pipeline_status_changed",
            Self::BuildFailed { .. } => "build_failed",
            Self::UnitStateChanged { .. } => "unit_state_changed",
            Self::UnitCrashed { .. } => "unit_crashed",
            Self::UnitRolledBack { .. } => "unit_rolled_back",
            Self::MutationRecorded { .. } => "mutation_recorded",
            Self::ReasoningStatusChanged { .. } => "reasoning_status_changed",
        }
    }
}
