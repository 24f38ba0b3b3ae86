//! Bounded log of every model call and tool dispatch, for observability
//! tooling. The runtime only writes to it.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use morph_core::ids::TranscriptId;

pub const TRANSCRIPT_CAPACITY: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: TranscriptId,
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied attribution tag, e.g. `reasoning:todo-list` or `tool:builtin`.
    pub source: String,
    pub prompt: Value,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TranscriptEntry {
    pub fn new(source: impl Into<String>, prompt: Value, tools: Vec<String>) -> Self {
        Self {
            id: TranscriptId::new(),
            timestamp: Utc::now(),
            source: source.into(),
            prompt,
            tools,
            response: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct TranscriptLog {
    entries: Mutex<VecDeque<TranscriptEntry>>,
    capacity: usize,
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::with_capacity(TRANSCRIPT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, entry: TranscriptEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn by_source(&self, source: &str) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<TranscriptEntry> {
        self.entries.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: usize) -> TranscriptEntry {
        TranscriptEntry::new("test", json!({ "n": n }), Vec::new())
    }

    #[test]
    fn caps_at_capacity_and_keeps_order() {
        let log = TranscriptLog::new();
        for n in 0..=TRANSCRIPT_CAPACITY {
            log.push(entry(n));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), TRANSCRIPT_CAPACITY);
        assert_eq!(entries[0].prompt["n"], 1);
        assert_eq!(entries[TRANSCRIPT_CAPACITY - 1].prompt["n"], TRANSCRIPT_CAPACITY);
        for pair in entries.windows(2) {
            assert!(pair[0].prompt["n"].as_u64() < pair[1].prompt["n"].as_u64());
        }
    }

    #[test]
    fn sustained_load_evicts_one_per_push() {
        let log = TranscriptLog::with_capacity(3);
        for n in 0..10 {
            log.push(entry(n));
            assert!(log.len() <= 3);
        }
        let ns: Vec<_> = log.entries().iter().map(|e| e.prompt["n"].clone()).collect();
        assert_eq!(ns, vec![json!(7), json!(8), json!(9)]);
    }

    #[test]
    fn filter_by_source() {
        let log = TranscriptLog::new();
        log.push(TranscriptEntry::new("a", Value::Null, Vec::new()));
        log.push(TranscriptEntry::new("b", Value::Null, Vec::new()).with_error("boom"));
        log.push(TranscriptEntry::new("a", Value::Null, Vec::new()));

        assert_eq!(log.by_source("a").len(), 2);
        let b = log.by_source("b");
        assert_eq!(b.len(), 1);
        assert!(b[0].is_error());
    }

    #[test]
    fn duration_is_recorded_in_millis() {
        let e = entry(0).with_duration(Duration::from_millis(1500));
        assert_eq!(e.duration_ms, 1500);
    }
}
