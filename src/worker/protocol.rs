//! Worker control protocol
//!
//! In-process callers talk to the worker with typed [`WorkerCommand`]s and
//! get typed [`WorkerReply`]s back. The same commands have a JSON wire form
//! for out-of-process coordinators:
//!
//! ```json
//! {"type": "request", "requestId": 7, "command": "capture-start", "payload": {...}}
//! {"type": "response", "requestId": 7, "ok": true, "payload": {...}}
//! {"type": "response", "requestId": 8, "ok": false, "reason": "UNKNOWN_COMMAND", "message": "..."}
//! ```
//!
//! Out-of-band messages (`ready`, `error`, `log`) use the same envelope.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CaptureError, CaptureResult, Failure, FailureReason},
    model::{CaptureSessionInfo, Frame, FrameMeta, PreviewImage, RuntimeRoute, StartRequest},
    perf::PerfSnapshot,
    preview::{PreviewConfig, PreviewStatus},
    transport::SharedFrameBuffer,
};

pub const CAPTURE_START: &str = "capture-start";
pub const CAPTURE_STOP: &str = "capture-stop";
pub const FRAME_META: &str = "frame-meta";
pub const FRAME_READ: &str = "frame-read";
pub const PREVIEW_CONFIG: &str = "preview-config";
pub const FRAME_READ_PREVIEW: &str = "frame-read-preview";
pub const FRAME_READ_PREVIEW_NATIVE: &str = "frame-read-preview-native";
pub const STATUS: &str = "status";
pub const BIND_SHARED: &str = "bind-shared";

/// Commands the worker answers
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    CaptureStart(StartRequest),
    CaptureStop,
    FrameMeta,
    FrameRead,
    PreviewConfig(PreviewConfig),
    FrameReadPreview,
    FrameReadPreviewNative,
    Status,
    /// Installs a shared region; only meaningful in-process
    BindShared(SharedFrameBuffer),
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::CaptureStart(_) => CAPTURE_START,
            WorkerCommand::CaptureStop => CAPTURE_STOP,
            WorkerCommand::FrameMeta => FRAME_META,
            WorkerCommand::FrameRead => FRAME_READ,
            WorkerCommand::PreviewConfig(_) => PREVIEW_CONFIG,
            WorkerCommand::FrameReadPreview => FRAME_READ_PREVIEW,
            WorkerCommand::FrameReadPreviewNative => FRAME_READ_PREVIEW_NATIVE,
            WorkerCommand::Status => STATUS,
            WorkerCommand::BindShared(_) => BIND_SHARED,
        }
    }

    /// Frame reads get the shorter frame budget
    pub fn is_frame_request(&self) -> bool {
        matches!(
            self,
            WorkerCommand::FrameRead
                | WorkerCommand::FrameReadPreview
                | WorkerCommand::FrameReadPreviewNative
        )
    }

    /// Decodes a wire command name and payload
    ///
    /// # Errors
    ///
    /// - [`CaptureError::UnknownCommand`] for an unrecognised name
    /// - [`CaptureError::InvalidParameter`] for a malformed payload
    /// - [`CaptureError::BindRejected`] for `bind-shared`, which cannot carry
    ///   a region over the wire
    pub fn from_wire(command: &str, payload: serde_json::Value) -> CaptureResult<Self> {
        let invalid = |e: serde_json::Error| CaptureError::InvalidParameter {
            parameter: "payload".to_string(),
            reason:    format!("{command}: {e}"),
        };

        Ok(match command {
            CAPTURE_START => {
                WorkerCommand::CaptureStart(serde_json::from_value(payload).map_err(invalid)?)
            }
            CAPTURE_STOP => WorkerCommand::CaptureStop,
            FRAME_META => WorkerCommand::FrameMeta,
            FRAME_READ => WorkerCommand::FrameRead,
            PREVIEW_CONFIG => {
                let payload = if payload.is_null() {
                    serde_json::json!({})
                } else {
                    payload
                };
                WorkerCommand::PreviewConfig(serde_json::from_value(payload).map_err(invalid)?)
            }
            FRAME_READ_PREVIEW => WorkerCommand::FrameReadPreview,
            FRAME_READ_PREVIEW_NATIVE => WorkerCommand::FrameReadPreviewNative,
            STATUS => WorkerCommand::Status,
            BIND_SHARED => {
                return Err(CaptureError::BindRejected {
                    reason: "shared regions can only be bound in-process".to_string(),
                });
            }
            other => {
                return Err(CaptureError::UnknownCommand {
                    command: other.to_string(),
                });
            }
        })
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    #[default]
    Idle,
    Starting,
    Capturing,
    Stopping,
    Error,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Capturing => "capturing",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
        }
    }
}

/// Reply to `capture-start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartedReply {
    pub session:       CaptureSessionInfo,
    pub route:         RuntimeRoute,
    pub backend_label: String,
    /// Candidates skipped by the selector before this one
    pub skipped:       Vec<String>,
    /// First sequence number this session will publish after
    pub frame_seq:     u64,
}

/// Frame counters shared by `frame-meta`, `frame-read` and `status`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrameStatus {
    pub frame_seq:        u64,
    pub last_frame_at_ms: Option<u64>,
    pub meta:             Option<FrameMeta>,
    pub has_frame:        bool,
    pub backend_error:    Option<Failure>,
}

/// Reply to `frame-read`; the pixels stay out of the JSON form
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReadReply {
    #[serde(flatten)]
    pub status: FrameStatus,
    #[serde(skip)]
    pub frame:  Option<Frame>,
}

/// Reply to `status`
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub state:                WorkerState,
    #[serde(flatten)]
    pub frames:               FrameStatus,
    pub route:                Option<RuntimeRoute>,
    pub backend_label:        Option<String>,
    pub read_failures:        u32,
    pub no_frame_streak:      u32,
    pub fallback_recommended: bool,
    pub shared_bound:         bool,
    pub perf:                 PerfSnapshot,
    pub preview:              PreviewStatus,
}

/// Typed reply for each command
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WorkerReply {
    Started(StartedReply),
    Stopped {
        #[serde(rename = "wasActive")]
        was_active: bool,
    },
    Meta(FrameStatus),
    Frame(FrameReadReply),
    PreviewConfigured(PreviewStatus),
    Preview(Option<PreviewImage>),
    Status(Box<WorkerStatus>),
    Bound { capacity: usize },
}

impl WorkerReply {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerReply::Started(_) => "started",
            WorkerReply::Stopped { .. } => "stopped",
            WorkerReply::Meta(_) => "meta",
            WorkerReply::Frame(_) => "frame",
            WorkerReply::PreviewConfigured(_) => "preview-configured",
            WorkerReply::Preview(_) => "preview",
            WorkerReply::Status(_) => "status",
            WorkerReply::Bound { .. } => "bound",
        }
    }
}

/// A request in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub request_id: u64,
    pub command:    String,
    #[serde(default)]
    pub payload:    serde_json::Value,
}

/// A response in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub request_id: u64,
    pub ok:         bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload:    Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason:     Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message:    Option<String>,
}

impl WireResponse {
    pub fn success(request_id: u64, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            ok: true,
            payload: Some(payload),
            reason: None,
            message: None,
        }
    }

    pub fn failure(request_id: u64, failure: Failure) -> Self {
        Self {
            request_id,
            ok: false,
            payload: None,
            reason: Some(failure.reason),
            message: Some(failure.message),
        }
    }

    pub fn from_result(request_id: u64, result: CaptureResult<WorkerReply>) -> Self {
        let encoded = result.and_then(|reply| {
            serde_json::to_value(&reply).map_err(|e| CaptureError::InvalidParameter {
                parameter: "reply".to_string(),
                reason:    e.to_string(),
            })
        });
        match encoded {
            Ok(payload) => Self::success(request_id, payload),
            Err(error) => Self::failure(request_id, error.to_failure()),
        }
    }

    /// Back to a result, for wire clients
    pub fn into_result(self) -> Result<serde_json::Value, Failure> {
        if self.ok {
            Ok(self.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(Failure::new(
                self.reason.unwrap_or(FailureReason::ReadFailed),
                self.message.unwrap_or_default(),
            ))
        }
    }
}

/// Log level of a `log` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Everything that crosses the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Request(WireRequest),
    Response(WireResponse),
    #[serde(rename_all = "camelCase")]
    Ready { worker_id: u64 },
    Error(Failure),
    Log { level: LogLevel, message: String },
}
