//! Read-only session diagnostics

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::trace::TraceEntry;
use crate::{
    error::Failure,
    model::{RuntimeRoute, TransportMode},
    perf::PerfSnapshot,
};

/// Coordinator-level session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Selecting,
    Starting,
    Running,
    /// A fallback transition is in progress
    Degrading,
    Stopped,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Selecting => "selecting",
            SessionPhase::Starting => "starting",
            SessionPhase::Running => "running",
            SessionPhase::Degrading => "degrading",
            SessionPhase::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub session_id:             String,
    pub phase:                  SessionPhase,
    pub runtime_route:          RuntimeRoute,
    pub fallback_level:         u8,
    pub backend_label:          String,
    pub transport_mode:         TransportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_reason:       Option<String>,
    /// Set once the session has left native capture for good
    pub transport_degraded:     bool,
    pub frame_seq:              u64,
    pub read_failures:          u32,
    pub no_frame_streak:        u32,
    pub bind_attempts:          u32,
    pub bind_failures:          u32,
    pub fallback_attempts:      u32,
    pub legacy_retry_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error:             Option<Failure>,
    pub perf:                   PerfSnapshot,
    pub trace:                  Vec<TraceEntry>,
}
