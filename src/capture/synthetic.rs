//! Synthetic capture backend for tests and the demo binary
//!
//! `SyntheticBackend` implements [`CaptureBackend`] without any OS capture
//! API. It renders a moving gradient into correctly padded frames and can be
//! scripted to misbehave.
//!
//! # Features
//!
//! - **Scripted reads:** a queue of [`ReadStep`]s consumed one per read, then
//!   a default step for every read after that
//! - **Failure injection:** start failures, read failures with any reason
//!   code, empty reads, fallback recommendations and panics
//! - **Configurable layout:** resolution, pixel format and row padding
//! - **Configurable delay:** every read sleeps first, bounded by the read
//!   timeout
//! - **Runtime control:** steps can be queued while a session is running
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```
//! use std::time::Duration;
//!
//! use hdr_capture_bridge::{
//!     capture::{CaptureBackend, SyntheticBackend},
//!     model::StartRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = SyntheticBackend::new("synthetic").with_resolution(64, 32);
//!
//!     let session = backend.start_capture(&StartRequest::new("screen:0", 60)).await.unwrap();
//!     let frame = backend
//!         .read_frame(session.native_session_id, Duration::from_millis(20))
//!         .await
//!         .unwrap();
//!     assert_eq!(frame.bytes.len(), (session.stride * session.height) as usize);
//! }
//! ```
//!
//! ## With Failure Injection
//!
//! ```
//! use std::time::Duration;
//!
//! use hdr_capture_bridge::{
//!     capture::{CaptureBackend, SyntheticBackend, synthetic::ReadStep},
//!     error::FailureReason,
//!     model::StartRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = SyntheticBackend::new("flaky")
//!         .with_read_script([ReadStep::Empty, ReadStep::Fail(FailureReason::ReadFailed)]);
//!
//!     let session = backend.start_capture(&StartRequest::new("screen:0", 30)).await.unwrap();
//!     let timeout = Duration::from_millis(10);
//!     assert!(backend.read_frame(session.native_session_id, timeout).await.unwrap().is_empty());
//!     assert!(backend.read_frame(session.native_session_id, timeout).await.is_err());
//!     assert!(!backend.read_frame(session.native_session_id, timeout).await.unwrap().is_empty());
//! }
//! ```

use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use super::{BackendCapabilities, CaptureBackend, constants::MAX_CAPTURE_PIXELS};
use crate::{
    error::{CaptureError, CaptureResult, Failure, FailureReason},
    model::{
        CaptureSessionInfo, CompressedFrame, PixelFormat, ProbeResult, RawFrame, StartRequest,
    },
    preview::{encode::encode_jpeg, image_buffer::FrameImage},
};

/// What one `read_frame` call does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    /// Return a rendered frame
    Frame,
    /// Complete without a frame
    Empty,
    /// Complete without a frame and ask for a lower tier
    RecommendFallback,
    /// Fail with the given reason
    Fail(FailureReason),
    /// Panic inside the backend
    Panic,
}

/// Call counters, for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub start_calls:     usize,
    pub stop_calls:      usize,
    pub read_calls:      usize,
    pub frames_rendered: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct SyntheticState {
    script:     VecDeque<ReadStep>,
    next_id:    u64,
    active:     HashSet<u64>,
    last_start: Option<StartRequest>,
    stats:      SyntheticStats,
    tick:       u32,
}

/// Scripted in-memory capture backend
///
/// Thread-safe; share it with `Arc` and keep a handle in tests to steer it
/// while a worker is reading from it.
#[derive(Debug)]
pub struct SyntheticBackend {
    label:         String,
    width:         u32,
    height:        u32,
    row_padding:   u32,
    pixel_format:  PixelFormat,
    capabilities:  BackendCapabilities,
    probe:         ProbeResult,
    /// Optional delay to simulate backend read latency
    delay:         Option<Duration>,
    /// Optional failure returned by every `start_capture`
    start_failure: Option<Failure>,
    default_step:  Mutex<ReadStep>,
    state:         Mutex<SyntheticState>,
}

impl SyntheticBackend {
    /// Creates a 320×180 BGRA backend that always returns frames
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label:         label.into(),
            width:         320,
            height:        180,
            row_padding:   0,
            pixel_format:  PixelFormat::Bgra8,
            capabilities:  BackendCapabilities::minimal(),
            probe:         ProbeResult::hdr_active(),
            delay:         None,
            start_failure: None,
            default_step:  Mutex::new(ReadStep::Frame),
            state:         Mutex::new(SyntheticState {
                next_id: 1,
                ..SyntheticState::default()
            }),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Pads every row by `bytes` so `stride > width * 4`
    pub fn with_row_padding(mut self, bytes: u32) -> Self {
        self.row_padding = bytes;
        self
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Enables `read_compressed_frame` (JPEG of the current pattern)
    pub fn with_compressed_preview(mut self) -> Self {
        self.capabilities.can_read_compressed = true;
        self
    }

    pub fn with_probe(mut self, probe: ProbeResult) -> Self {
        self.probe = probe;
        self
    }

    /// Sleeps before every read (bounded by the read timeout)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every `start_capture` fail
    pub fn with_start_failure(mut self, failure: Failure) -> Self {
        self.start_failure = Some(failure);
        self
    }

    /// Queues steps consumed one per read
    pub fn with_read_script(self, steps: impl IntoIterator<Item = ReadStep>) -> Self {
        self.push_steps(steps);
        self
    }

    /// Step used once the script is exhausted
    pub fn with_default_step(self, step: ReadStep) -> Self {
        self.set_default_step(step);
        self
    }

    /// Queues more steps at runtime
    pub fn push_steps(&self, steps: impl IntoIterator<Item = ReadStep>) {
        self.state.lock().script.extend(steps);
    }

    /// Replaces the default step at runtime
    pub fn set_default_step(&self, step: ReadStep) {
        *self.default_step.lock() = step;
    }

    pub fn stats(&self) -> SyntheticStats {
        let state = self.state.lock();
        SyntheticStats {
            active_sessions: state.active.len(),
            ..state.stats
        }
    }

    /// The request passed to the most recent `start_capture`
    pub fn last_start_request(&self) -> Option<StartRequest> {
        self.state.lock().last_start.clone()
    }

    fn stride(&self) -> u32 {
        self.width * 4 + self.row_padding
    }

    fn next_step(&self) -> ReadStep {
        let mut state = self.state.lock();
        state.stats.read_calls += 1;
        match state.script.pop_front() {
            Some(step) => step,
            None => *self.default_step.lock(),
        }
    }

    fn ensure_active(&self, native_session_id: u64) -> CaptureResult<()> {
        if self.state.lock().active.contains(&native_session_id) {
            Ok(())
        } else {
            Err(CaptureError::InvalidSession { native_session_id })
        }
    }

    /// Renders the moving gradient for the current tick
    fn render(&self) -> RawFrame {
        let tick = {
            let mut state = self.state.lock();
            state.tick = state.tick.wrapping_add(1);
            state.stats.frames_rendered += 1;
            state.tick
        };

        let stride = self.stride() as usize;
        let mut bytes = vec![0u8; stride * self.height as usize];
        for (y, row) in bytes.chunks_exact_mut(stride).enumerate() {
            for x in 0..self.width as usize {
                let r = (x as u32).wrapping_add(tick) as u8;
                let g = (y as u32).wrapping_add(tick) as u8;
                let b = 128u8;
                let px = &mut row[x * 4..x * 4 + 4];
                match self.pixel_format {
                    PixelFormat::Rgba8 => px.copy_from_slice(&[r, g, b, 255]),
                    PixelFormat::Bgra8 => px.copy_from_slice(&[b, g, r, 255]),
                }
            }
        }

        RawFrame {
            bytes,
            width: self.width,
            height: self.height,
            stride: self.stride(),
            pixel_format: Some(self.pixel_format),
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            fallback_recommended: false,
        }
    }

    async fn apply_delay(&self, timeout: Duration) {
        if let Some(delay) = self.delay {
            sleep(delay.min(timeout)).await;
        }
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    fn label(&self) -> &str {
        &self.label
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn probe(&self, _request: &StartRequest) -> CaptureResult<ProbeResult> {
        Ok(self.probe.clone())
    }

    async fn start_capture(&self, request: &StartRequest) -> CaptureResult<CaptureSessionInfo> {
        {
            let mut state = self.state.lock();
            state.stats.start_calls += 1;
            state.last_start = Some(request.clone());
        }

        if let Some(failure) = &self.start_failure {
            return Err(CaptureError::from_failure(failure.clone()));
        }

        let pixels = u64::from(self.width) * u64::from(self.height);
        if pixels > MAX_CAPTURE_PIXELS {
            return Err(CaptureError::FrameTooLarge {
                byte_length: (pixels * 4) as usize,
                limit:       (MAX_CAPTURE_PIXELS * 4) as usize,
            });
        }

        let mut state = self.state.lock();
        let native_session_id = state.next_id;
        state.next_id += 1;
        state.active.insert(native_session_id);
        tracing::debug!(label = %self.label, native_session_id, "synthetic capture started");

        Ok(CaptureSessionInfo {
            native_session_id,
            width: self.width,
            height: self.height,
            stride: self.stride(),
            pixel_format: self.pixel_format,
        })
    }

    async fn read_frame(
        &self,
        native_session_id: u64,
        timeout: Duration,
    ) -> CaptureResult<RawFrame> {
        self.ensure_active(native_session_id)?;
        self.apply_delay(timeout).await;

        match self.next_step() {
            ReadStep::Frame => Ok(self.render()),
            ReadStep::Empty => Ok(RawFrame::empty()),
            ReadStep::RecommendFallback => Ok(RawFrame {
                fallback_recommended: true,
                ..RawFrame::empty()
            }),
            ReadStep::Fail(reason) => Err(CaptureError::from_failure(Failure::new(
                reason,
                format!("{} scripted read failure", self.label),
            ))),
            ReadStep::Panic => panic!("{} scripted read panic", self.label),
        }
    }

    async fn read_compressed_frame(
        &self,
        native_session_id: u64,
        timeout: Duration,
    ) -> CaptureResult<CompressedFrame> {
        if !self.capabilities.can_read_compressed {
            return Err(CaptureError::PreviewUnavailable {
                reason: format!("{} has no compressed frame path", self.label),
            });
        }
        self.ensure_active(native_session_id)?;
        self.apply_delay(timeout).await;

        let raw = self.render();
        let pixel_format = raw.pixel_format.unwrap_or(self.pixel_format);
        let image = FrameImage::from_raw(&raw.bytes, raw.width, raw.height, raw.stride, pixel_format)?;
        let bytes = encode_jpeg(&image, 75)?;
        Ok(CompressedFrame {
            bytes,
            mime_type: "image/jpeg".to_string(),
            width: raw.width,
            height: raw.height,
            timestamp_ms: raw.timestamp_ms,
        })
    }

    async fn stop_capture(&self, native_session_id: u64) -> CaptureResult<()> {
        let mut state = self.state.lock();
        state.stats.stop_calls += 1;
        if state.active.remove(&native_session_id) {
            tracing::debug!(label = %self.label, native_session_id, "synthetic capture stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(20);

    async fn started(backend: &SyntheticBackend) -> CaptureSessionInfo {
        backend
            .start_capture(&StartRequest::new("screen:0", 60))
            .await
            .expect("start should succeed")
    }

    #[tokio::test]
    async fn test_frame_layout_with_padding() {
        let backend = SyntheticBackend::new("padded")
            .with_resolution(10, 4)
            .with_row_padding(24);
        let session = started(&backend).await;

        assert_eq!(session.stride, 64);
        let frame = backend.read_frame(session.native_session_id, TIMEOUT).await.unwrap();
        assert_eq!(frame.bytes.len(), 64 * 4);
        assert_eq!(frame.stride, 64);
        // padding bytes stay zeroed
        assert!(frame.bytes[40..64].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_pixel_format_channel_order() {
        let backend = SyntheticBackend::new("rgba")
            .with_resolution(2, 1)
            .with_pixel_format(PixelFormat::Rgba8);
        let session = started(&backend).await;
        let frame = backend.read_frame(session.native_session_id, TIMEOUT).await.unwrap();

        assert_eq!(frame.pixel_format, Some(PixelFormat::Rgba8));
        assert_eq!(frame.bytes[2], 128);
        assert_eq!(frame.bytes[3], 255);
    }

    #[tokio::test]
    async fn test_script_then_default_step() {
        let backend = SyntheticBackend::new("scripted")
            .with_read_script([ReadStep::Empty, ReadStep::RecommendFallback])
            .with_default_step(ReadStep::Fail(FailureReason::InvalidSession));
        let session = started(&backend).await;
        let id = session.native_session_id;

        assert!(backend.read_frame(id, TIMEOUT).await.unwrap().is_empty());
        assert!(backend.read_frame(id, TIMEOUT).await.unwrap().fallback_recommended);
        let error = backend.read_frame(id, TIMEOUT).await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::InvalidSession);
        assert_eq!(backend.stats().read_calls, 3);
    }

    #[tokio::test]
    async fn test_start_failure_injection() {
        let backend = SyntheticBackend::new("broken")
            .with_start_failure(Failure::new(FailureReason::StartFailed, "adapter lost"));

        let error = backend
            .start_capture(&StartRequest::new("screen:0", 60))
            .await
            .unwrap_err();
        assert_eq!(error.reason(), FailureReason::StartFailed);
        assert!(error.to_string().contains("adapter lost"));
        assert_eq!(backend.stats().start_calls, 1);
        assert_eq!(backend.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_oversized_capture_is_rejected_at_start() {
        let backend = SyntheticBackend::new("8k").with_resolution(7680, 4320);
        let error = backend
            .start_capture(&StartRequest::new("screen:0", 60))
            .await
            .unwrap_err();
        assert_eq!(error.reason(), FailureReason::FrameTooLarge);
    }

    #[tokio::test]
    async fn test_read_after_stop_is_invalid_session() {
        let backend = SyntheticBackend::new("stopped");
        let session = started(&backend).await;
        backend.stop_capture(session.native_session_id).await.unwrap();
        // second stop is best-effort and still succeeds
        backend.stop_capture(session.native_session_id).await.unwrap();

        let error = backend
            .read_frame(session.native_session_id, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(error.reason(), FailureReason::InvalidSession);
        assert_eq!(backend.stats().stop_calls, 2);
    }

    #[tokio::test]
    async fn test_records_last_start_request() {
        let backend = SyntheticBackend::new("recorder");
        let request = StartRequest::new("window:42", 30).with_display(7);
        backend.start_capture(&request).await.unwrap();

        assert_eq!(backend.last_start_request(), Some(request));
    }

    #[tokio::test]
    async fn test_compressed_preview_is_jpeg() {
        let backend = SyntheticBackend::new("compressed")
            .with_resolution(32, 16)
            .with_compressed_preview();
        let session = started(&backend).await;

        let frame = backend
            .read_compressed_frame(session.native_session_id, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(frame.mime_type, "image/jpeg");
        assert_eq!(&frame.bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_bounded_by_timeout() {
        let backend = SyntheticBackend::new("slow").with_delay(Duration::from_secs(10));
        let session = started(&backend).await;

        let start = tokio::time::Instant::now();
        backend.read_frame(session.native_session_id, TIMEOUT).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
