//! Capture worker
//!
//! A worker hosts at most one capture session on its own task and answers
//! the control protocol in [`protocol`]. The coordinator never touches a
//! backend directly: it sends commands through a [`WorkerHandle`], watches
//! [`PumpReport`]s for failure counters, and decides on fallback itself.
//!
//! Every request carries a timeout. A worker that stops answering turns into
//! `REQUEST_TIMEOUT`, and one that is gone turns into `WORKER_EXITED`, never
//! a hang.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use hdr_capture_bridge::{
//!     capture::{BackendKind, BackendRegistry, StaticBackendLoader, SyntheticBackend},
//!     model::{RuntimeRoute, StartRequest},
//!     worker::{WorkerOptions, spawn_worker},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let loader = StaticBackendLoader::new()
//!         .with_backend(BackendKind::Wgc, Arc::new(SyntheticBackend::new("wgc")));
//!     let worker = spawn_worker(Arc::new(BackendRegistry::new(loader)), WorkerOptions::default());
//!
//!     let started = worker.start_capture(StartRequest::new("screen:0", 60)).await.unwrap();
//!     assert_eq!(started.route, RuntimeRoute::WgcV1);
//!
//!     assert!(worker.stop_capture().await.unwrap());
//!     assert!(!worker.stop_capture().await.unwrap());
//!     worker.shutdown().await;
//! }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{
        BackendRegistry,
        constants::{BridgeConfig, CONTROL_TIMEOUT_MS, FRAME_TIMEOUT_MS, READ_FAILURE_LIMIT},
    },
    error::{CaptureError, CaptureResult, Failure},
    model::{PreviewImage, RuntimeRoute, StartRequest},
    perf::PerfSnapshot,
    preview::{PreviewConfig, PreviewStatus},
    transport::{FrameSink, PushFrameSender, SharedFrameBuffer},
};

pub mod protocol;
mod pump;

use protocol::{
    FrameReadReply, FrameStatus, StartedReply, WireRequest, WireResponse, WorkerCommand,
    WorkerMessage, WorkerReply, WorkerState, WorkerStatus,
};
use pump::{Worker, WorkerParts};

const REQUEST_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

/// Worker settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerOptions {
    pub worker_id:          u64,
    pub control_timeout:    Duration,
    pub frame_timeout:      Duration,
    pub read_failure_limit: u32,
    pub preview:            PreviewConfig,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id:          0,
            control_timeout:    Duration::from_millis(CONTROL_TIMEOUT_MS),
            frame_timeout:      Duration::from_millis(FRAME_TIMEOUT_MS),
            read_failure_limit: READ_FAILURE_LIMIT,
            preview:            PreviewConfig::default(),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(worker_id: u64, config: &BridgeConfig) -> Self {
        Self {
            worker_id,
            control_timeout: Duration::from_millis(config.control_timeout_ms),
            frame_timeout: Duration::from_millis(config.frame_timeout_ms),
            read_failure_limit: config.read_failure_limit,
            preview: PreviewConfig::default(),
        }
    }
}

/// Snapshot of the pump after every tick and lifecycle change
#[derive(Debug, Clone, Default)]
pub struct PumpReport {
    /// Incremented on every `capture-start`
    pub generation:           u64,
    pub state:                WorkerState,
    pub route:                Option<RuntimeRoute>,
    pub frame_seq:            u64,
    pub started_at:           Option<Instant>,
    pub last_frame_at:        Option<Instant>,
    pub read_failures:        u32,
    pub no_frame_streak:      u32,
    pub last_failure:         Option<Failure>,
    pub fallback_recommended: bool,
    pub perf:                 PerfSnapshot,
}

impl PumpReport {
    /// Time since the last frame, or since start if none arrived yet
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let since = match (self.last_frame_at, self.started_at) {
            (Some(frame), Some(start)) => frame.max(start),
            (Some(frame), None) => frame,
            (None, Some(start)) => start,
            (None, None) => return None,
        };
        Some(now.saturating_duration_since(since))
    }
}

pub(crate) struct Envelope {
    pub request_id: u64,
    pub command:    WorkerCommand,
    pub reply:      oneshot::Sender<CaptureResult<WorkerReply>>,
}

/// Spawns a worker task on the current runtime
pub fn spawn_worker(registry: Arc<BackendRegistry>, options: WorkerOptions) -> WorkerHandle {
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
    let (reports_tx, reports_rx) = watch::channel(PumpReport::default());
    let (events_tx, events_rx) = broadcast::channel(EVENT_QUEUE);
    let push = PushFrameSender::new();
    let session_cancel = Arc::new(Mutex::new(None));
    let shutdown = CancellationToken::new();

    let worker = Worker::new(WorkerParts {
        worker_id: options.worker_id,
        registry,
        read_failure_limit: options.read_failure_limit,
        preview: options.preview,
        push: push.clone(),
        reports: reports_tx,
        events: events_tx.clone(),
        session_cancel: Arc::clone(&session_cancel),
    });
    let task = tokio::spawn(worker.run(requests_rx, shutdown.clone()));

    WorkerHandle {
        worker_id: options.worker_id,
        requests: requests_tx,
        next_request_id: AtomicU64::new(1),
        control_timeout: options.control_timeout,
        frame_timeout: options.frame_timeout,
        reports: reports_rx,
        events: events_tx,
        initial_events: Mutex::new(Some(events_rx)),
        push,
        session_cancel,
        shutdown,
        task: Mutex::new(Some(task)),
    }
}

/// Coordinator-side handle to one worker
///
/// Dropping the handle shuts the worker down.
pub struct WorkerHandle {
    worker_id:       u64,
    requests:        mpsc::Sender<Envelope>,
    next_request_id: AtomicU64,
    control_timeout: Duration,
    frame_timeout:   Duration,
    reports:         watch::Receiver<PumpReport>,
    events:          broadcast::Sender<WorkerMessage>,
    initial_events:  Mutex<Option<broadcast::Receiver<WorkerMessage>>>,
    push:            PushFrameSender,
    session_cancel:  Arc<Mutex<Option<CancellationToken>>>,
    shutdown:        CancellationToken,
    task:            Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Sends one command and waits for its reply within the command's budget
    ///
    /// # Errors
    ///
    /// - [`CaptureError::RequestTimeout`] if the worker does not answer in time
    /// - [`CaptureError::WorkerExited`] if the worker task is gone
    /// - whatever the worker returned for the command
    pub async fn request(&self, command: WorkerCommand) -> CaptureResult<WorkerReply> {
        let timeout = if command.is_frame_request() {
            self.frame_timeout
        } else {
            self.control_timeout
        };
        let name = command.name();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.requests
            .send(Envelope {
                request_id,
                command,
                reply: tx,
            })
            .await
            .map_err(|_| CaptureError::WorkerExited)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::WorkerExited),
            Err(_) => Err(CaptureError::RequestTimeout {
                command:     name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn start_capture(&self, request: StartRequest) -> CaptureResult<StartedReply> {
        match self.request(WorkerCommand::CaptureStart(request)).await? {
            WorkerReply::Started(started) => Ok(started),
            other => Err(unexpected("started", &other)),
        }
    }

    /// Stops the running session; `Ok(false)` if there was none
    ///
    /// The session is cancelled before the request is queued, so a read
    /// already in flight is discarded rather than published.
    pub async fn stop_capture(&self) -> CaptureResult<bool> {
        if let Some(cancel) = self.session_cancel.lock().as_ref() {
            cancel.cancel();
        }
        match self.request(WorkerCommand::CaptureStop).await? {
            WorkerReply::Stopped { was_active } => Ok(was_active),
            other => Err(unexpected("stopped", &other)),
        }
    }

    pub async fn frame_meta(&self) -> CaptureResult<FrameStatus> {
        match self.request(WorkerCommand::FrameMeta).await? {
            WorkerReply::Meta(status) => Ok(status),
            other => Err(unexpected("meta", &other)),
        }
    }

    pub async fn read_frame(&self) -> CaptureResult<FrameReadReply> {
        match self.request(WorkerCommand::FrameRead).await? {
            WorkerReply::Frame(frame) => Ok(frame),
            other => Err(unexpected("frame", &other)),
        }
    }

    pub async fn configure_preview(&self, config: PreviewConfig) -> CaptureResult<PreviewStatus> {
        match self.request(WorkerCommand::PreviewConfig(config)).await? {
            WorkerReply::PreviewConfigured(status) => Ok(status),
            other => Err(unexpected("preview-configured", &other)),
        }
    }

    /// Latest encoded preview, `None` until the first encode finishes
    pub async fn read_preview(&self) -> CaptureResult<Option<PreviewImage>> {
        match self.request(WorkerCommand::FrameReadPreview).await? {
            WorkerReply::Preview(image) => Ok(image),
            other => Err(unexpected("preview", &other)),
        }
    }

    /// Backend-encoded preview, if the backend has one
    pub async fn read_native_preview(&self) -> CaptureResult<PreviewImage> {
        match self.request(WorkerCommand::FrameReadPreviewNative).await? {
            WorkerReply::Preview(Some(image)) => Ok(image),
            other => Err(unexpected("preview", &other)),
        }
    }

    pub async fn status(&self) -> CaptureResult<WorkerStatus> {
        match self.request(WorkerCommand::Status).await? {
            WorkerReply::Status(status) => Ok(*status),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Answers a request in wire form
    pub async fn handle_wire(&self, request: WireRequest) -> WireResponse {
        let request_id = request.request_id;
        let result = match WorkerCommand::from_wire(&request.command, request.payload) {
            Ok(command) => self.request(command).await,
            Err(error) => Err(error),
        };
        WireResponse::from_result(request_id, result)
    }

    /// Latest pump report
    pub fn report(&self) -> PumpReport {
        self.reports.borrow().clone()
    }

    /// Receiver that wakes on every new pump report
    pub fn reports(&self) -> watch::Receiver<PumpReport> {
        self.reports.clone()
    }

    /// Out-of-band messages from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.events.subscribe()
    }

    /// Out-of-band messages since spawn, including `ready`; only once
    pub fn take_events(&self) -> Option<broadcast::Receiver<WorkerMessage>> {
        self.initial_events.lock().take()
    }

    pub fn is_alive(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Stops any session and waits for the worker task to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(worker_id = self.worker_id, "worker task failed: {e}");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl FrameSink for WorkerHandle {
    async fn bind_shared(&self, buffer: SharedFrameBuffer) -> CaptureResult<()> {
        match self.request(WorkerCommand::BindShared(buffer)).await? {
            WorkerReply::Bound { .. } => Ok(()),
            other => Err(unexpected("bound", &other)),
        }
    }

    fn push_source(&self) -> PushFrameSender {
        self.push.clone()
    }
}

fn unexpected(expected: &str, reply: &WorkerReply) -> CaptureError {
    CaptureError::InvalidParameter {
        parameter: "reply".to_string(),
        reason:    format!("expected a {expected} reply, got {}", reply.kind()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        capture::{
            BackendKind, StaticBackendLoader, SyntheticBackend,
            synthetic::ReadStep,
        },
        error::FailureReason,
        model::{PixelFormat, RouteAvailability, RoutePreference},
        transport::ConsumerCapabilities,
    };

    fn registry_with(backend: Arc<SyntheticBackend>) -> Arc<BackendRegistry> {
        let loader = StaticBackendLoader::new().with_backend(BackendKind::Wgc, backend);
        Arc::new(BackendRegistry::new(loader))
    }

    async fn wait_for(worker: &WorkerHandle, predicate: impl Fn(&PumpReport) -> bool) -> PumpReport {
        let mut reports = worker.reports();
        loop {
            {
                let report = reports.borrow_and_update();
                if predicate(&report) {
                    return report.clone();
                }
            }
            reports.changed().await.unwrap();
        }
    }

    // ========== Lifecycle ==========

    #[tokio::test]
    async fn test_ready_event_on_spawn() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions {
                worker_id: 7,
                ..WorkerOptions::default()
            },
        );
        let mut events = worker.take_events().unwrap();

        assert_eq!(events.recv().await.unwrap(), WorkerMessage::Ready { worker_id: 7 });
        assert!(worker.take_events().is_none());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_publishes_frames() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_resolution(32, 16));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        let started = worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        assert_eq!(started.session.width, 32);
        assert_eq!(started.frame_seq, 0);

        let report = wait_for(&worker, |r| r.frame_seq >= 3).await;
        assert_eq!(report.state, WorkerState::Capturing);
        assert_eq!(report.route, Some(RuntimeRoute::WgcV1));

        let read = worker.read_frame().await.unwrap();
        assert!(read.status.has_frame);
        let frame = read.frame.unwrap();
        assert_eq!(frame.bytes.len(), 32 * 4 * 16);
        assert_eq!(frame.pixel_format, PixelFormat::Bgra8);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_frame_read_before_capture_has_no_frame() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );

        let read = worker.read_frame().await.unwrap();
        assert!(!read.status.has_frame);
        assert!(read.frame.is_none());
        assert_eq!(read.status.frame_seq, 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = Arc::new(SyntheticBackend::new("wgc"));
        let worker = spawn_worker(registry_with(Arc::clone(&backend)), WorkerOptions::default());

        assert!(!worker.stop_capture().await.unwrap());
        worker.start_capture(StartRequest::new("screen:0", 30)).await.unwrap();
        assert!(worker.stop_capture().await.unwrap());
        assert!(!worker.stop_capture().await.unwrap());

        assert_eq!(backend.stats().stop_calls, 1);
        assert_eq!(backend.stats().active_sessions, 0);
        assert_eq!(worker.status().await.unwrap().state, WorkerState::Idle);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_backend_reports_error() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        let request = StartRequest::new("screen:0", 30).with_availability(RouteAvailability {
            wgc_enabled:    false,
            legacy_enabled: false,
        });

        let error = worker.start_capture(request).await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::NativeUnavailable);

        let status = worker.status().await.unwrap();
        assert_eq!(status.state, WorkerState::Error);
        assert_eq!(
            status.frames.backend_error.map(|f| f.reason),
            Some(FailureReason::NativeUnavailable)
        );
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_with_resume_keeps_sequence() {
        let backend = Arc::new(SyntheticBackend::new("wgc"));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        let before = wait_for(&worker, |r| r.frame_seq >= 2).await.frame_seq;

        let mut resumed = StartRequest::new("screen:0", 120).with_route(RoutePreference::Wgc);
        resumed.resume_sequence = true;
        let started = worker.start_capture(resumed).await.unwrap();
        assert!(started.frame_seq >= before);

        let fresh = worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        assert_eq!(fresh.frame_seq, 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_padded_4k_frames_are_accepted() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_resolution(3840, 2160).with_row_padding(64));
        let worker = spawn_worker(
            registry_with(backend),
            WorkerOptions {
                preview: PreviewConfig {
                    enabled: false,
                    ..PreviewConfig::default()
                },
                ..WorkerOptions::default()
            },
        );

        let started = worker.start_capture(StartRequest::new("screen:0", 10)).await.unwrap();
        assert_eq!(started.session.stride, 3840 * 4 + 64);

        let report = wait_for(&worker, |r| r.frame_seq >= 2 || r.state == WorkerState::Error).await;
        assert_eq!(report.state, WorkerState::Capturing);
        assert!(report.last_failure.is_none());

        let frame = worker.read_frame().await.unwrap().frame.unwrap();
        assert_eq!(frame.bytes.len(), (3840 * 4 + 64) * 2160);
        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_discarded_after_cancel_keeps_pump_cadence() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_delay(Duration::from_millis(20)));
        let worker = spawn_worker(registry_with(Arc::clone(&backend)), WorkerOptions::default());

        // 10 fps: one read every 100ms plus the 20ms read itself
        worker.start_capture(StartRequest::new("screen:0", 10)).await.unwrap();
        wait_for(&worker, |r| r.frame_seq >= 1).await;

        // cancel the session without the follow-up capture-stop
        if let Some(cancel) = worker.session_cancel.lock().as_ref() {
            cancel.cancel();
        }
        let before = backend.stats().read_calls;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let reads = backend.stats().read_calls - before;

        assert!(reads <= 10, "{reads} reads in one second after cancel");
        worker.shutdown().await;
    }

    // ========== Failure handling ==========

    #[tokio::test]
    async fn test_read_failures_escalate_at_limit() {
        let backend = Arc::new(
            SyntheticBackend::new("wgc").with_default_step(ReadStep::Fail(FailureReason::ReadFailed)),
        );
        let worker = spawn_worker(
            registry_with(backend),
            WorkerOptions {
                read_failure_limit: 3,
                ..WorkerOptions::default()
            },
        );
        let mut events = worker.subscribe();

        worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        let report = wait_for(&worker, |r| r.state == WorkerState::Error).await;

        assert_eq!(report.read_failures, 3);
        assert_eq!(report.last_failure.map(|f| f.reason), Some(FailureReason::ReadFailed));
        loop {
            if let WorkerMessage::Error(failure) = events.recv().await.unwrap() {
                assert_eq!(failure.reason, FailureReason::ReadFailed);
                break;
            }
        }
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_hard_reason_escalates_immediately() {
        let backend = Arc::new(
            SyntheticBackend::new("wgc").with_read_script([ReadStep::Fail(FailureReason::InvalidSession)]),
        );
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        worker.start_capture(StartRequest::new("screen:0", 60)).await.unwrap();
        let report = wait_for(&worker, |r| r.state == WorkerState::Error).await;

        assert_eq!(report.read_failures, 1);
        assert_eq!(report.frame_seq, 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_panic_becomes_read_failure() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_read_script([ReadStep::Panic]));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        worker.start_capture(StartRequest::new("screen:0", 60)).await.unwrap();
        let report = wait_for(&worker, |r| r.frame_seq >= 1).await;

        assert_eq!(report.state, WorkerState::Capturing);
        assert_eq!(report.read_failures, 0);
        assert!(worker.is_alive());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_reads_grow_streak_without_failures() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_default_step(ReadStep::Empty));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        let report = wait_for(&worker, |r| r.no_frame_streak >= 4).await;

        assert_eq!(report.read_failures, 0);
        assert_eq!(report.state, WorkerState::Capturing);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_recommendation_is_reported() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_read_script([ReadStep::RecommendFallback]));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        worker.start_capture(StartRequest::new("screen:0", 60)).await.unwrap();
        let report = wait_for(&worker, |r| r.fallback_recommended).await;
        assert_eq!(report.state, WorkerState::Capturing);
        worker.shutdown().await;
    }

    /// A handle whose requests land in a queue nobody answers
    fn unanswered_handle(timeout: Duration) -> (WorkerHandle, mpsc::Receiver<Envelope>) {
        let (requests, inbox) = mpsc::channel(4);
        let (_, reports) = watch::channel(PumpReport::default());
        let (events, _) = broadcast::channel(4);
        let handle = WorkerHandle {
            worker_id: 0,
            requests,
            next_request_id: AtomicU64::new(1),
            control_timeout: timeout,
            frame_timeout: timeout,
            reports,
            events,
            initial_events: Mutex::new(None),
            push: PushFrameSender::new(),
            session_cancel: Arc::default(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        };
        (handle, inbox)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let (worker, _inbox) = unanswered_handle(Duration::from_millis(50));

        let error = worker.read_frame().await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::RequestTimeout);
        assert!(error.to_string().contains("frame-read"));
    }

    #[tokio::test]
    async fn test_dropped_request_reports_exit() {
        let (worker, mut inbox) = unanswered_handle(Duration::from_secs(5));
        let drain = tokio::spawn(async move {
            // drop the reply sender without answering
            let envelope = inbox.recv().await;
            drop(envelope);
        });

        let error = worker.status().await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::WorkerExited);
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_report_exit() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        worker.shutdown().await;

        let error = worker.status().await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::WorkerExited);
        assert!(!worker.is_alive());
    }

    // ========== Transport and preview ==========

    #[tokio::test]
    async fn test_bind_shared_publishes_into_region() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_resolution(16, 8));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());

        let buffer = SharedFrameBuffer::with_capacity(16 * 8 * 4).unwrap();
        let error = worker.bind_shared(buffer.clone()).await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::InvalidSession);

        worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        worker.bind_shared(buffer.clone()).await.unwrap();

        let mut reader = buffer.reader();
        let seq = wait_for(&worker, |r| r.frame_seq >= 3).await.frame_seq;
        let received = reader.poll().unwrap();
        assert!(received.frame.seq <= seq);
        assert_eq!(received.frame.width, 16);
        assert!(worker.status().await.unwrap().shared_bound);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_source_receives_frames() {
        let backend = Arc::new(SyntheticBackend::new("wgc"));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());
        let mut reader = worker.push_source().subscribe();

        worker.start_capture(StartRequest::new("screen:0", 120)).await.unwrap();
        let first = reader.next().await.unwrap();
        let second = reader.next().await.unwrap();
        assert!(second.frame.seq > first.frame.seq);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_preview_is_encoded() {
        let backend = Arc::new(SyntheticBackend::new("wgc").with_resolution(64, 32));
        let worker = spawn_worker(registry_with(backend), WorkerOptions::default());
        worker.start_capture(StartRequest::new("screen:0", 60)).await.unwrap();

        let image = loop {
            if let Some(image) = worker.read_preview().await.unwrap() {
                break image;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!((image.width, image.height), (64, 32));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_preview_is_unavailable() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        let status = worker
            .configure_preview(PreviewConfig {
                enabled: false,
                ..PreviewConfig::default()
            })
            .await
            .unwrap();
        assert!(!status.enabled);

        let error = worker.read_preview().await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::PreviewUnavailable);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_native_preview_needs_capability() {
        let plain = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        plain.start_capture(StartRequest::new("screen:0", 30)).await.unwrap();
        let error = plain.read_native_preview().await.unwrap_err();
        assert_eq!(error.reason(), FailureReason::PreviewUnavailable);
        plain.shutdown().await;

        let capable = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc").with_compressed_preview())),
            WorkerOptions::default(),
        );
        capable.start_capture(StartRequest::new("screen:0", 30)).await.unwrap();
        let image = capable.read_native_preview().await.unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        capable.shutdown().await;
    }

    // ========== Wire protocol ==========

    #[tokio::test]
    async fn test_wire_unknown_command() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        let response = worker
            .handle_wire(WireRequest {
                request_id: 5,
                command:    "frame-rewind".to_string(),
                payload:    serde_json::Value::Null,
            })
            .await;

        assert_eq!(response.request_id, 5);
        assert!(!response.ok);
        assert_eq!(response.reason, Some(FailureReason::UnknownCommand));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_wire_status() {
        let worker = spawn_worker(
            registry_with(Arc::new(SyntheticBackend::new("wgc"))),
            WorkerOptions::default(),
        );
        let response = worker
            .handle_wire(WireRequest {
                request_id: 1,
                command:    "status".to_string(),
                payload:    serde_json::Value::Null,
            })
            .await;

        let payload = response.into_result().unwrap();
        assert_eq!(payload["state"], "idle");
        assert_eq!(payload["frameSeq"], 0);
        assert_eq!(payload["hasFrame"], false);
        worker.shutdown().await;
    }

    #[test]
    fn test_idle_for_prefers_latest_instant() {
        let start = Instant::now();
        let report = PumpReport {
            started_at: Some(start),
            last_frame_at: Some(start + Duration::from_millis(300)),
            ..PumpReport::default()
        };
        assert_eq!(
            report.idle_for(start + Duration::from_millis(500)),
            Some(Duration::from_millis(200))
        );
        assert_eq!(PumpReport::default().idle_for(start), None);
    }

    #[test]
    fn test_default_consumer_is_shared() {
        assert!(ConsumerCapabilities::default().shared_memory);
    }
}
