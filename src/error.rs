//! Error types for capture negotiation and frame transport
//!
//! Every failure in the pipeline maps to one stable [`FailureReason`] code.
//! Codes are what crosses the worker boundary (inside a [`Failure`]) and what
//! the coordinator's fallback policy inspects; the human-readable message is
//! informational only.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Stable wire code for every failure the pipeline can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NotSupported,
    NativeUnavailable,
    StartFailed,
    ReadFailed,
    NoFrame,
    FrameTooLarge,
    InvalidSession,
    BindRejected,
    BindCloneBlocked,
    BindTimeout,
    PreviewEncodeFailed,
    PreviewUnavailable,
    RequestTimeout,
    WorkerExited,
    UnknownCommand,
    InvalidParameter,
    RouteBlocked,
    IoError,
    FallbackExhausted,
}

impl FailureReason {
    /// Returns the wire spelling of this code (e.g. `"READ_FAILED"`)
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NotSupported => "NOT_SUPPORTED",
            FailureReason::NativeUnavailable => "NATIVE_UNAVAILABLE",
            FailureReason::StartFailed => "START_FAILED",
            FailureReason::ReadFailed => "READ_FAILED",
            FailureReason::NoFrame => "NO_FRAME",
            FailureReason::FrameTooLarge => "FRAME_TOO_LARGE",
            FailureReason::InvalidSession => "INVALID_SESSION",
            FailureReason::BindRejected => "BIND_REJECTED",
            FailureReason::BindCloneBlocked => "BIND_CLONE_BLOCKED",
            FailureReason::BindTimeout => "BIND_TIMEOUT",
            FailureReason::PreviewEncodeFailed => "PREVIEW_ENCODE_FAILED",
            FailureReason::PreviewUnavailable => "PREVIEW_UNAVAILABLE",
            FailureReason::RequestTimeout => "REQUEST_TIMEOUT",
            FailureReason::WorkerExited => "WORKER_EXITED",
            FailureReason::UnknownCommand => "UNKNOWN_COMMAND",
            FailureReason::InvalidParameter => "INVALID_PARAMETER",
            FailureReason::RouteBlocked => "ROUTE_BLOCKED",
            FailureReason::IoError => "IO_ERROR",
            FailureReason::FallbackExhausted => "FALLBACK_EXHAUSTED",
        }
    }

    /// Classifies the code for propagation and fallback decisions
    ///
    /// # Examples
    ///
    /// ```
    /// use hdr_capture_bridge::error::{ErrorSeverity, FailureReason};
    ///
    /// assert_eq!(FailureReason::FrameTooLarge.severity(), ErrorSeverity::Hard);
    /// assert_eq!(FailureReason::NoFrame.severity(), ErrorSeverity::Transient);
    /// assert_eq!(FailureReason::BindTimeout.severity(), ErrorSeverity::TransportDegrade);
    /// ```
    pub fn severity(self) -> ErrorSeverity {
        match self {
            FailureReason::NotSupported
            | FailureReason::RouteBlocked
            | FailureReason::FallbackExhausted => ErrorSeverity::Fatal,
            FailureReason::FrameTooLarge
            | FailureReason::InvalidSession
            | FailureReason::NativeUnavailable
            | FailureReason::StartFailed
            | FailureReason::WorkerExited => ErrorSeverity::Hard,
            FailureReason::ReadFailed
            | FailureReason::NoFrame
            | FailureReason::RequestTimeout
            | FailureReason::IoError => ErrorSeverity::Transient,
            FailureReason::BindRejected
            | FailureReason::BindCloneBlocked
            | FailureReason::BindTimeout => ErrorSeverity::TransportDegrade,
            FailureReason::PreviewEncodeFailed
            | FailureReason::PreviewUnavailable
            | FailureReason::UnknownCommand
            | FailureReason::InvalidParameter => ErrorSeverity::NonFatal,
        }
    }

    /// Reasons that force an immediate tier fallback with no retry
    pub fn is_hard_fallback(self) -> bool {
        matches!(
            self,
            FailureReason::FrameTooLarge
                | FailureReason::InvalidSession
                | FailureReason::NativeUnavailable
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a failure is allowed to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSeverity {
    /// The tier (or the whole session) cannot be used
    Fatal,
    /// Immediate tier fallback, no retry
    Hard,
    /// Absorbed with counters and backoff until a threshold is crossed
    Transient,
    /// Drop to the next transport, keep the session
    TransportDegrade,
    /// Never affects the main capture path
    NonFatal,
}

/// Structured `{reason, message}` result used at every worker boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Failure {
    pub reason:  FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Error type for capture negotiation, worker control and frame transport
///
/// Each variant carries one [`FailureReason`] (see [`CaptureError::reason`])
/// and an actionable hint through [`CaptureError::remediation_hint`].
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Platform or backend is absent
    #[error("Capture backend not supported: {message}")]
    NotSupported { message: String },

    /// Native capture module could not be loaded or vanished mid-session
    #[error("Native capture module unavailable: {message}")]
    NativeUnavailable { message: String },

    /// Backend refused to start a capture session
    #[error("Capture start failed: {message}")]
    StartFailed { message: String },

    /// Backend read raised an error
    #[error("Frame read failed: {message}")]
    ReadFailed { message: String },

    /// Read completed without a frame
    #[error("No frame available")]
    NoFrame,

    /// Frame exceeds the transport's byte limit
    #[error("Frame of {byte_length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Size of the rejected frame
        byte_length: usize,
        /// Largest frame the transport accepts
        limit:       usize,
    },

    /// Backend no longer recognises the native session
    #[error("Native capture session {native_session_id} is invalid")]
    InvalidSession { native_session_id: u64 },

    /// Shared-buffer bind rejected by the consumer environment or the worker
    #[error("Shared buffer bind rejected: {reason}")]
    BindRejected { reason: String },

    /// Consumer cannot receive shared memory across its isolation boundary
    #[error("Shared buffer cannot be cloned into a non-isolated consumer")]
    BindCloneBlocked,

    /// Shared-buffer bind did not complete in time
    #[error("Shared buffer bind timed out after {duration_ms}ms")]
    BindTimeout { duration_ms: u64 },

    /// Preview encoder failed on a frame
    #[error("Preview encode failed: {reason}")]
    PreviewEncodeFailed { reason: String },

    /// No preview can be produced right now
    #[error("Preview unavailable: {reason}")]
    PreviewUnavailable { reason: String },

    /// Worker did not answer a request within its budget
    #[error("Worker request '{command}' timed out after {duration_ms}ms")]
    RequestTimeout {
        /// Command that timed out
        command:     String,
        /// Budget that was exceeded
        duration_ms: u64,
    },

    /// Worker task has gone away
    #[error("Capture worker exited")]
    WorkerExited,

    /// Worker received a command it does not understand
    #[error("Unknown worker command '{command}'")]
    UnknownCommand { command: String },

    /// Invalid parameter provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter
        parameter: String,
        /// Reason why it's invalid
        reason:    String,
    },

    /// A forced route is unavailable and falling back is not permitted
    #[error("Capture route blocked: {reason}")]
    RouteBlocked { reason: String },

    /// Every native tier has failed for this session
    #[error("All native capture tiers exhausted: {reason}")]
    FallbackExhausted { reason: String },

    /// I/O error occurred
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CaptureError {
    /// Stable reason code for this error
    pub fn reason(&self) -> FailureReason {
        match self {
            CaptureError::NotSupported { .. } => FailureReason::NotSupported,
            CaptureError::NativeUnavailable { .. } => FailureReason::NativeUnavailable,
            CaptureError::StartFailed { .. } => FailureReason::StartFailed,
            CaptureError::ReadFailed { .. } => FailureReason::ReadFailed,
            CaptureError::NoFrame => FailureReason::NoFrame,
            CaptureError::FrameTooLarge { .. } => FailureReason::FrameTooLarge,
            CaptureError::InvalidSession { .. } => FailureReason::InvalidSession,
            CaptureError::BindRejected { .. } => FailureReason::BindRejected,
            CaptureError::BindCloneBlocked => FailureReason::BindCloneBlocked,
            CaptureError::BindTimeout { .. } => FailureReason::BindTimeout,
            CaptureError::PreviewEncodeFailed { .. } => FailureReason::PreviewEncodeFailed,
            CaptureError::PreviewUnavailable { .. } => FailureReason::PreviewUnavailable,
            CaptureError::RequestTimeout { .. } => FailureReason::RequestTimeout,
            CaptureError::WorkerExited => FailureReason::WorkerExited,
            CaptureError::UnknownCommand { .. } => FailureReason::UnknownCommand,
            CaptureError::InvalidParameter { .. } => FailureReason::InvalidParameter,
            CaptureError::RouteBlocked { .. } => FailureReason::RouteBlocked,
            CaptureError::FallbackExhausted { .. } => FailureReason::FallbackExhausted,
            CaptureError::IoError(_) => FailureReason::IoError,
        }
    }

    /// Severity of this error, derived from its reason code
    pub fn severity(&self) -> ErrorSeverity {
        self.reason().severity()
    }

    /// Converts into the structured form sent across the worker boundary
    pub fn to_failure(&self) -> Failure {
        Failure::new(self.reason(), self.to_string())
    }

    /// Rebuilds an error from a structured failure
    ///
    /// Variants with numeric context (frame size, session id, durations) lose
    /// that context; the message is preserved where the variant carries one.
    ///
    /// # Examples
    ///
    /// ```
    /// use hdr_capture_bridge::error::{CaptureError, Failure, FailureReason};
    ///
    /// let failure = Failure::new(FailureReason::StartFailed, "device lost");
    /// let error = CaptureError::from_failure(failure);
    /// assert_eq!(error.reason(), FailureReason::StartFailed);
    /// assert!(error.to_string().contains("device lost"));
    /// ```
    pub fn from_failure(failure: Failure) -> Self {
        let Failure { reason, message } = failure;
        match reason {
            FailureReason::NotSupported => CaptureError::NotSupported { message },
            FailureReason::NativeUnavailable => CaptureError::NativeUnavailable { message },
            FailureReason::StartFailed => CaptureError::StartFailed { message },
            FailureReason::ReadFailed => CaptureError::ReadFailed { message },
            FailureReason::NoFrame => CaptureError::NoFrame,
            FailureReason::FrameTooLarge => CaptureError::FrameTooLarge {
                byte_length: 0,
                limit:       0,
            },
            FailureReason::InvalidSession => CaptureError::InvalidSession {
                native_session_id: 0,
            },
            FailureReason::BindRejected => CaptureError::BindRejected { reason: message },
            FailureReason::BindCloneBlocked => CaptureError::BindCloneBlocked,
            FailureReason::BindTimeout => CaptureError::BindTimeout { duration_ms: 0 },
            FailureReason::PreviewEncodeFailed => {
                CaptureError::PreviewEncodeFailed { reason: message }
            }
            FailureReason::PreviewUnavailable => {
                CaptureError::PreviewUnavailable { reason: message }
            }
            FailureReason::RequestTimeout => CaptureError::RequestTimeout {
                command:     message,
                duration_ms: 0,
            },
            FailureReason::WorkerExited => CaptureError::WorkerExited,
            FailureReason::UnknownCommand => CaptureError::UnknownCommand { command: message },
            FailureReason::InvalidParameter => CaptureError::InvalidParameter {
                parameter: "payload".to_string(),
                reason:    message,
            },
            FailureReason::RouteBlocked => CaptureError::RouteBlocked { reason: message },
            FailureReason::IoError => {
                CaptureError::IoError(std::io::Error::other(message))
            }
            FailureReason::FallbackExhausted => {
                CaptureError::FallbackExhausted { reason: message }
            }
        }
    }

    /// Returns an actionable remediation hint for this error
    ///
    /// # Examples
    ///
    /// ```
    /// use hdr_capture_bridge::error::CaptureError;
    ///
    /// let error = CaptureError::BindCloneBlocked;
    /// assert!(error.remediation_hint().contains("cross-origin"));
    /// ```
    pub fn remediation_hint(&self) -> &str {
        match self {
            CaptureError::NotSupported { .. } => {
                "This capture tier is not available on this platform. The selector will try the \
                 next tier automatically."
            }
            CaptureError::NativeUnavailable { .. } => {
                "The native capture module failed to load. Check that the capture addon is \
                 installed for this architecture, or disable the route to skip it."
            }
            CaptureError::StartFailed { .. } => {
                "The backend refused to start. Verify the source and display ids are still valid \
                 and that no other process holds an exclusive capture."
            }
            CaptureError::ReadFailed { .. } | CaptureError::NoFrame => {
                "Frame reads are failing transiently. The pump retries with backoff and falls \
                 back to a lower tier if failures persist."
            }
            CaptureError::FrameTooLarge { .. } => {
                "The captured frame exceeds the transport limit. Reduce the capture resolution or \
                 set max_output_pixels."
            }
            CaptureError::InvalidSession { .. } => {
                "The native session was torn down underneath the worker (display change, driver \
                 reset). The coordinator restarts capture on a lower tier."
            }
            CaptureError::BindRejected { .. } => {
                "Shared memory is not available to the consumer. Frames are delivered through \
                 the push buffer or HTTP endpoint instead."
            }
            CaptureError::BindCloneBlocked => {
                "The consumer is not cross-origin isolated, so shared memory cannot be handed \
                 over. Enable cross-origin isolation to use the shared-buffer transport."
            }
            CaptureError::BindTimeout { .. } => {
                "The worker did not confirm the shared buffer in time. Raise \
                 HDR_BRIDGE_BIND_TIMEOUT_MS on slow systems."
            }
            CaptureError::PreviewEncodeFailed { .. } | CaptureError::PreviewUnavailable { .. } => {
                "Preview is disabled for this session. The main capture path is unaffected."
            }
            CaptureError::RequestTimeout { .. } => {
                "The capture worker is unresponsive. Raise HDR_BRIDGE_CONTROL_TIMEOUT_MS or \
                 HDR_BRIDGE_FRAME_TIMEOUT_MS if the backend is slow to respond."
            }
            CaptureError::WorkerExited => {
                "The capture worker stopped. Start a new session; the coordinator has already \
                 released its buffers."
            }
            CaptureError::UnknownCommand { .. } => {
                "The worker does not recognise this command. Check the coordinator and worker \
                 are from the same build."
            }
            CaptureError::InvalidParameter { .. } => {
                "Check the parameter value against the API documentation."
            }
            CaptureError::RouteBlocked { .. } => {
                "The forced native route is unavailable. Switch the mapping mode to auto to allow \
                 the builtin desktop fallback."
            }
            CaptureError::FallbackExhausted { .. } => {
                "No native capture tier could sustain the session. Use the builtin desktop \
                 capture path."
            }
            CaptureError::IoError(_) => {
                "An I/O error occurred. Check that the frame server port is free and system \
                 resources are available."
            }
        }
    }
}

impl From<Failure> for CaptureError {
    fn from(failure: Failure) -> Self {
        CaptureError::from_failure(failure)
    }
}

impl From<&CaptureError> for Failure {
    fn from(error: &CaptureError) -> Self {
        error.to_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_spelling_matches_serde() {
        let json = serde_json::to_string(&FailureReason::BindCloneBlocked).unwrap();
        assert_eq!(json, "\"BIND_CLONE_BLOCKED\"");
        assert_eq!(FailureReason::BindCloneBlocked.as_str(), "BIND_CLONE_BLOCKED");

        let parsed: FailureReason = serde_json::from_str("\"FRAME_TOO_LARGE\"").unwrap();
        assert_eq!(parsed, FailureReason::FrameTooLarge);
    }

    #[test]
    fn test_hard_fallback_reasons() {
        assert!(FailureReason::FrameTooLarge.is_hard_fallback());
        assert!(FailureReason::InvalidSession.is_hard_fallback());
        assert!(FailureReason::NativeUnavailable.is_hard_fallback());
        assert!(!FailureReason::ReadFailed.is_hard_fallback());
        assert!(!FailureReason::NoFrame.is_hard_fallback());
        assert!(!FailureReason::StartFailed.is_hard_fallback());
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(FailureReason::NotSupported.severity(), ErrorSeverity::Fatal);
        assert_eq!(FailureReason::StartFailed.severity(), ErrorSeverity::Hard);
        assert_eq!(FailureReason::ReadFailed.severity(), ErrorSeverity::Transient);
        assert_eq!(FailureReason::BindRejected.severity(), ErrorSeverity::TransportDegrade);
        assert_eq!(FailureReason::PreviewEncodeFailed.severity(), ErrorSeverity::NonFatal);
        assert_eq!(FailureReason::PreviewUnavailable.severity(), ErrorSeverity::NonFatal);
    }

    #[test]
    fn test_frame_too_large_message() {
        let error = CaptureError::FrameTooLarge {
            byte_length: 40_000_000,
            limit:       33_177_600,
        };

        let msg = error.to_string();
        assert!(msg.contains("40000000"));
        assert!(msg.contains("33177600"));
        assert_eq!(error.reason(), FailureReason::FrameTooLarge);
        assert!(error.remediation_hint().contains("max_output_pixels"));
    }

    #[test]
    fn test_to_failure_carries_reason_and_message() {
        let error = CaptureError::StartFailed {
            message: "duplication interface busy".to_string(),
        };

        let failure = error.to_failure();
        assert_eq!(failure.reason, FailureReason::StartFailed);
        assert!(failure.message.contains("duplication interface busy"));
    }

    #[test]
    fn test_failure_json_shape() {
        let failure = Failure::new(FailureReason::ReadFailed, "timeout");
        let value = serde_json::to_value(&failure).unwrap();

        assert_eq!(value["reason"], "READ_FAILED");
        assert_eq!(value["message"], "timeout");
    }

    #[test]
    fn test_from_failure_keeps_reason_for_every_code() {
        let reasons = [
            FailureReason::NotSupported,
            FailureReason::NativeUnavailable,
            FailureReason::StartFailed,
            FailureReason::ReadFailed,
            FailureReason::NoFrame,
            FailureReason::FrameTooLarge,
            FailureReason::InvalidSession,
            FailureReason::BindRejected,
            FailureReason::BindCloneBlocked,
            FailureReason::BindTimeout,
            FailureReason::PreviewEncodeFailed,
            FailureReason::PreviewUnavailable,
            FailureReason::RequestTimeout,
            FailureReason::WorkerExited,
            FailureReason::UnknownCommand,
            FailureReason::InvalidParameter,
            FailureReason::RouteBlocked,
            FailureReason::IoError,
            FailureReason::FallbackExhausted,
        ];

        for reason in reasons {
            let error = CaptureError::from(Failure::new(reason, "x"));
            assert_eq!(error.reason(), reason, "reason {reason} changed on rebuild");
        }
    }

    #[test]
    fn test_bind_errors_degrade_transport() {
        for error in [
            CaptureError::BindRejected {
                reason: "no shared memory".to_string(),
            },
            CaptureError::BindCloneBlocked,
            CaptureError::BindTimeout { duration_ms: 2000 },
        ] {
            assert_eq!(error.severity(), ErrorSeverity::TransportDegrade);
        }
    }

    #[test]
    fn test_request_timeout_remediation() {
        let error = CaptureError::RequestTimeout {
            command:     "capture-start".to_string(),
            duration_ms: 4000,
        };

        assert!(error.to_string().contains("capture-start"));
        assert!(error.remediation_hint().contains("HDR_BRIDGE_CONTROL_TIMEOUT_MS"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let error: CaptureError = io_error.into();

        assert!(error.to_string().contains("I/O error"));
        assert_eq!(error.reason(), FailureReason::IoError);
        assert!(error.remediation_hint().contains("port"));
    }
}
