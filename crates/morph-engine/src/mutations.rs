//! Append-only, bounded history of source mutations. It is the only source
//! of rollback targets.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use morph_core::ids::{ComponentId, MutationId};
use morph_core::status::MutationOutcome;

pub const MUTATION_CAPACITY: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: MutationId,
    pub timestamp: DateTime<Utc>,
    pub component_id: ComponentId,
    pub trigger: String,
    pub previous_source: String,
    pub new_source: String,
    pub outcome: MutationOutcome,
}

pub struct MutationLog {
    entries: Mutex<VecDeque<MutationRecord>>,
    capacity: usize,
}

impl Default for MutationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationLog {
    pub fn new() -> Self {
        Self::with_capacity(MUTATION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Build and append a record, returning a copy of it.
    pub fn record(
        &self,
        component_id: &ComponentId,
        trigger: impl Into<String>,
        previous_source: impl Into<String>,
        new_source: impl Into<String>,
        outcome: MutationOutcome,
    ) -> MutationRecord {
        let record = MutationRecord {
            id: MutationId::new(),
            timestamp: Utc::now(),
            component_id: component_id.clone(),
            trigger: trigger.into(),
            previous_source: previous_source.into(),
            new_source: new_source.into(),
            outcome,
        };
        self.push(record.clone());
        record
    }

    /// Append, evicting the oldest record (of any component) when full.
    pub fn push(&self, record: MutationRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<MutationRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn for_component(&self, id: &ComponentId) -> Vec<MutationRecord> {
        self.entries
            .lock()
            .iter()
            .filter(|r| &r.component_id == id)
            .cloned()
            .collect()
    }

    /// Most recent record for `id` whose `previous_source` can serve as a
    /// rollback target. Rollback records and records whose previous source
    /// equals `current` are skipped.
    pub fn last_known_good(&self, id: &ComponentId, current: Option<&str>) -> Option<MutationRecord> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|r| &r.component_id == id)
            .filter(|r| r.outcome != MutationOutcome::Rollback)
            .filter(|r| !r.previous_source.is_empty())
            .find(|r| Some(r.previous_source.as_str()) != current)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
