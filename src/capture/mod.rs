//! Capture backend abstraction, loading and selection
//!
//! This module provides the seam between the pipeline and the native capture
//! APIs. It includes:
//!
//! - [`CaptureBackend`]: trait every native backend implements
//! - [`BackendCapabilities`]: which operations a backend exposes, checked once
//!   at load time
//! - [`registry`]: lazy, cached backend loading
//! - [`selector`]: ordered tier selection and the native/fallback mapping
//!   decision
//! - [`synthetic`]: a scripted in-memory backend for tests and the demo binary

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CaptureError, CaptureResult},
    model::{CaptureSessionInfo, CompressedFrame, ProbeResult, RawFrame, StartRequest},
};

pub mod constants;
pub mod registry;
pub mod selector;
pub mod synthetic;

pub use registry::{BackendKind, BackendLoader, BackendRegistry, LoadError, StaticBackendLoader};
pub use selector::{Selection, select_backend};
pub use synthetic::SyntheticBackend;

/// Operations a backend exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub can_start:           bool,
    pub can_read:            bool,
    pub can_read_compressed: bool,
}

impl BackendCapabilities {
    /// Start and read, no compressed preview
    pub fn minimal() -> Self {
        Self {
            can_start:           true,
            can_read:            true,
            can_read_compressed: false,
        }
    }

    pub fn full() -> Self {
        Self {
            can_read_compressed: true,
            ..Self::minimal()
        }
    }

    pub fn none() -> Self {
        Self {
            can_start:           false,
            can_read:            false,
            can_read_compressed: false,
        }
    }

    /// A backend is usable only if it can both start and read
    pub fn meets_minimum(&self) -> bool {
        self.can_start && self.can_read
    }
}

/// Interface to one native capture API
///
/// Backends are stateless factories for native sessions: everything about a
/// running capture is addressed by the `native_session_id` returned from
/// [`start_capture`](CaptureBackend::start_capture). Implementations must be
/// `Send + Sync`; the worker calls them from its own task and the selector
/// may probe them concurrently.
///
/// A read that completes without a new frame returns an empty [`RawFrame`]
/// rather than an error. Errors are reserved for reads that failed.
///
/// # Examples
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use hdr_capture_bridge::{capture::*, error::CaptureResult, model::*};
///
/// struct DesktopDuplication;
///
/// #[async_trait]
/// impl CaptureBackend for DesktopDuplication {
///     fn label(&self) -> &str {
///         "windows-hdr-capture"
///     }
///
///     fn capabilities(&self) -> BackendCapabilities {
///         BackendCapabilities::minimal()
///     }
///
///     async fn probe(&self, _request: &StartRequest) -> CaptureResult<ProbeResult> {
///         Ok(ProbeResult::hdr_active())
///     }
///
///     // start_capture / read_frame / stop_capture against the OS API
/// }
/// ```
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Human-readable backend name (e.g. `windows-wgc-hdr-capture`)
    fn label(&self) -> &str;

    /// Operations this backend supports
    fn capabilities(&self) -> BackendCapabilities;

    /// Reports whether capture is supported for the request and whether HDR
    /// is active on the target display
    async fn probe(&self, request: &StartRequest) -> CaptureResult<ProbeResult>;

    /// Starts a native session
    async fn start_capture(&self, request: &StartRequest) -> CaptureResult<CaptureSessionInfo>;

    /// Reads the latest frame, waiting at most `timeout`
    async fn read_frame(&self, native_session_id: u64, timeout: Duration)
    -> CaptureResult<RawFrame>;

    /// Reads a backend-encoded preview image
    ///
    /// Only called when [`BackendCapabilities::can_read_compressed`] is set.
    async fn read_compressed_frame(
        &self,
        _native_session_id: u64,
        _timeout: Duration,
    ) -> CaptureResult<CompressedFrame> {
        Err(CaptureError::PreviewUnavailable {
            reason: format!("{} has no compressed frame path", self.label()),
        })
    }

    /// Stops a native session
    async fn stop_capture(&self, native_session_id: u64) -> CaptureResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_capabilities() {
        assert!(BackendCapabilities::minimal().meets_minimum());
        assert!(BackendCapabilities::full().meets_minimum());
        assert!(!BackendCapabilities::none().meets_minimum());

        let start_only = BackendCapabilities {
            can_read: false,
            ..BackendCapabilities::minimal()
        };
        assert!(!start_only.meets_minimum());
    }

    #[tokio::test]
    async fn test_default_compressed_read_is_unavailable() {
        let backend = SyntheticBackend::new("plain");
        let result = backend.read_compressed_frame(1, Duration::from_millis(5)).await;

        match result {
            Err(CaptureError::PreviewUnavailable { reason }) => assert!(reason.contains("plain")),
            other => panic!("expected PreviewUnavailable, got {other:?}"),
        }
    }
}
