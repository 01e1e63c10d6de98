//! Bounded fallback trace
//!
//! Every route or transport transition of a session is appended here with a
//! wall-clock timestamp and the attempt counter at the time. Only the most
//! recent [`TRACE_CAPACITY`] entries are kept.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{capture::constants::TRACE_CAPACITY, model::RuntimeRoute};

/// What happened at a trace point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TraceKind {
    Selected,
    Started,
    StartFailed,
    Transport,
    Fallback,
    Degraded,
    Stopped,
}

/// One trace entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub at:      DateTime<Utc>,
    pub kind:    TraceKind,
    pub route:   RuntimeRoute,
    pub reason:  String,
    /// Fallback attempts made in the session when the entry was written
    pub attempt: u32,
}

/// Ring of the last `capacity` entries
#[derive(Debug, Clone)]
pub struct TraceRing {
    entries:  VecDeque<TraceEntry>,
    capacity: usize,
    total:    u64,
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::with_capacity(TRACE_CAPACITY)
    }
}

impl TraceRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, kind: TraceKind, route: RuntimeRoute, reason: impl Into<String>, attempt: u32) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            at: Utc::now(),
            kind,
            route,
            reason: reason.into(),
            attempt,
        });
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ever pushed, including evicted ones
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn latest(&self) -> Option<&TraceEntry> {
        self.entries.back()
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_latest_entries() {
        let mut ring = TraceRing::with_capacity(3);
        for attempt in 0..5 {
            ring.push(TraceKind::Fallback, RuntimeRoute::WgcV1, format!("R{attempt}"), attempt);
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.total(), 5);
        let reasons: Vec<_> = ring.snapshot().into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, ["R2", "R3", "R4"]);
        assert_eq!(ring.latest().map(|e| e.attempt), Some(4));
    }

    #[test]
    fn test_default_capacity() {
        let mut ring = TraceRing::default();
        for _ in 0..TRACE_CAPACITY + 10 {
            ring.push(TraceKind::Transport, RuntimeRoute::NativeLegacy, "BIND_TIMEOUT", 0);
        }
        assert_eq!(ring.len(), TRACE_CAPACITY);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let mut ring = TraceRing::default();
        ring.push(TraceKind::StartFailed, RuntimeRoute::WgcV1, "START_FAILED", 1);

        let value = serde_json::to_value(ring.latest().unwrap()).unwrap();
        assert_eq!(value["kind"], "start-failed");
        assert_eq!(value["route"], "wgc-v1");
        assert_eq!(value["attempt"], 1);
        assert!(value["at"].is_string());
    }
}
