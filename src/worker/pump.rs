//! The worker task: one capture session and its frame pump
//!
//! Everything here runs on a single task. Requests and pump ticks are
//! interleaved by one `select!` loop, so a tick never overlaps another tick
//! or a request, and the reusable frame buffer and shared region have exactly
//! one writer.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    Envelope, PumpReport,
    protocol::{
        FrameReadReply, FrameStatus, LogLevel, StartedReply, WorkerCommand, WorkerMessage,
        WorkerReply, WorkerState, WorkerStatus,
    },
};
use crate::{
    capture::{
        BackendRegistry, CaptureBackend, Selection,
        constants::{
            MAX_CAPTURE_PIXELS, MAX_FRAME_BYTES, MAX_REGION_BYTES, backoff_ms, payload_bytes, pump_interval_ms,
            read_timeout_ms,
        },
        select_backend,
    },
    error::{CaptureError, CaptureResult, Failure},
    model::{CaptureSessionInfo, Frame, PreviewImage, RawFrame, RuntimeRoute, StartRequest},
    perf::{PumpPerf, millis, time_async, time_sync},
    preview::{PreviewConfig, PreviewState, render_preview},
    transport::{PushFrameSender, SharedFrameBuffer},
};

type PreviewJob = JoinHandle<(u64, CaptureResult<PreviewImage>, Duration)>;

struct ActiveSession {
    backend:       Arc<dyn CaptureBackend>,
    info:          CaptureSessionInfo,
    route:         RuntimeRoute,
    backend_label: String,
    pump_interval: Duration,
    read_timeout:  Duration,
    cancel:        CancellationToken,
    next_tick:     Instant,
    started_at:    Instant,
}

pub(super) struct Worker {
    worker_id:            u64,
    registry:             Arc<BackendRegistry>,
    read_failure_limit:   u32,
    state:                WorkerState,
    session:              Option<ActiveSession>,
    generation:           u64,
    frame_seq:            u64,
    last_frame:           Option<Frame>,
    last_frame_at:        Option<Instant>,
    last_frame_at_ms:     Option<u64>,
    /// Grow-only staging buffer every frame is copied through
    frame_buffer:         Vec<u8>,
    shared:               Option<SharedFrameBuffer>,
    push:                 PushFrameSender,
    preview_config:       PreviewConfig,
    preview:              PreviewState,
    pending_preview:      Option<PreviewJob>,
    latest_preview:       Option<PreviewImage>,
    perf:                 PumpPerf,
    backend_error:        Option<Failure>,
    read_failures:        u32,
    no_frame_streak:      u32,
    fallback_recommended: bool,
    reports:              watch::Sender<PumpReport>,
    events:               broadcast::Sender<WorkerMessage>,
    session_cancel:       Arc<Mutex<Option<CancellationToken>>>,
}

pub(super) struct WorkerParts {
    pub worker_id:          u64,
    pub registry:           Arc<BackendRegistry>,
    pub read_failure_limit: u32,
    pub preview:            PreviewConfig,
    pub push:               PushFrameSender,
    pub reports:            watch::Sender<PumpReport>,
    pub events:             broadcast::Sender<WorkerMessage>,
    pub session_cancel:     Arc<Mutex<Option<CancellationToken>>>,
}

impl Worker {
    pub(super) fn new(parts: WorkerParts) -> Self {
        Self {
            worker_id:            parts.worker_id,
            registry:             parts.registry,
            read_failure_limit:   parts.read_failure_limit.max(1),
            state:                WorkerState::Idle,
            session:              None,
            generation:           0,
            frame_seq:            0,
            last_frame:           None,
            last_frame_at:        None,
            last_frame_at_ms:     None,
            frame_buffer:         Vec::new(),
            shared:               None,
            push:                 parts.push,
            preview_config:       parts.preview,
            preview:              PreviewState::new(parts.preview, 60),
            pending_preview:      None,
            latest_preview:       None,
            perf:                 PumpPerf::default(),
            backend_error:        None,
            read_failures:        0,
            no_frame_streak:      0,
            fallback_recommended: false,
            reports:              parts.reports,
            events:               parts.events,
            session_cancel:       parts.session_cancel,
        }
    }

    /// Serves requests and pump ticks until shutdown or every handle is gone
    pub(super) async fn run(mut self, mut requests: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        self.emit(WorkerMessage::Ready {
            worker_id: self.worker_id,
        });
        debug!(worker_id = self.worker_id, "capture worker ready");

        loop {
            let next_tick = self
                .session
                .as_ref()
                .filter(|_| self.state == WorkerState::Capturing)
                .map(|session| session.next_tick);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                envelope = requests.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
                _ = sleep_until(next_tick) => self.pump_tick().await,
            }
        }

        self.stop_session().await;
        self.shared = None;
        debug!(worker_id = self.worker_id, "capture worker exited");
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let Envelope {
            request_id,
            command,
            reply,
        } = envelope;
        let name = command.name();
        trace!(request_id, command = name, "worker request");

        let result = self.handle(command).await;
        if let Err(error) = &result {
            debug!(request_id, command = name, reason = %error.reason(), "worker request failed: {error}");
        }
        if reply.send(result).is_err() {
            trace!(request_id, command = name, "requester went away before the reply");
        }
    }

    async fn handle(&mut self, command: WorkerCommand) -> CaptureResult<WorkerReply> {
        match command {
            WorkerCommand::CaptureStart(request) => self.start(request).await.map(WorkerReply::Started),
            WorkerCommand::CaptureStop => Ok(WorkerReply::Stopped {
                was_active: self.stop_session().await,
            }),
            WorkerCommand::FrameMeta => Ok(WorkerReply::Meta(self.frame_status())),
            WorkerCommand::FrameRead => Ok(WorkerReply::Frame(FrameReadReply {
                status: self.frame_status(),
                frame:  self.last_frame.clone(),
            })),
            WorkerCommand::PreviewConfig(config) => {
                self.preview_config = config;
                self.preview.reconfigure(config);
                Ok(WorkerReply::PreviewConfigured(self.preview.status()))
            }
            WorkerCommand::FrameReadPreview => self.read_preview(),
            WorkerCommand::FrameReadPreviewNative => self
                .read_native_preview()
                .await
                .map(|image| WorkerReply::Preview(Some(image))),
            WorkerCommand::Status => Ok(WorkerReply::Status(Box::new(self.status()))),
            WorkerCommand::BindShared(buffer) => self.bind_shared(buffer),
        }
    }

    // ========== Session lifecycle ==========

    async fn start(&mut self, request: StartRequest) -> CaptureResult<StartedReply> {
        if self.session.is_some() {
            self.stop_session().await;
        }
        self.generation += 1;
        self.set_state(WorkerState::Starting);

        match self.open_session(&request).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                warn!(source = %request.source_id, reason = %error.reason(), "capture start failed: {error}");
                self.backend_error = Some(error.to_failure());
                self.set_state(WorkerState::Error);
                self.publish_report();
                Err(error)
            }
        }
    }

    async fn open_session(&mut self, request: &StartRequest) -> CaptureResult<StartedReply> {
        let selection = select_backend(&self.registry, request.route_preference, request.availability);
        let (kind, backend, backend_label, skipped) = match selection {
            Selection::Native {
                kind,
                backend,
                backend_label,
                skipped,
            } => (kind, backend, backend_label, skipped),
            Selection::Builtin { reason } => {
                return Err(CaptureError::NativeUnavailable { message: reason });
            }
        };

        let info = AssertUnwindSafe(backend.start_capture(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(CaptureError::StartFailed {
                    message: format!("{backend_label} panicked during start"),
                })
            })?;
        if let Err(error) = validate_session(&info) {
            // the native session exists; do not leak it
            let _ = backend.stop_capture(info.native_session_id).await;
            return Err(error);
        }

        let fps = request.clamped_fps();
        let interval_ms = pump_interval_ms(fps);
        let pump_interval = Duration::from_millis(interval_ms);
        let read_timeout = Duration::from_millis(read_timeout_ms(interval_ms));

        self.reset_counters();
        if !request.resume_sequence {
            self.frame_seq = 0;
        }
        self.preview = PreviewState::new(self.preview_config, fps);

        let cancel = CancellationToken::new();
        *self.session_cancel.lock() = Some(cancel.clone());
        let now = Instant::now();
        self.session = Some(ActiveSession {
            backend,
            info,
            route: kind.route(),
            backend_label: backend_label.clone(),
            pump_interval,
            read_timeout,
            cancel,
            next_tick: now,
            started_at: now,
        });
        self.set_state(WorkerState::Capturing);
        info!(
            source = %request.source_id,
            route = kind.route().as_str(),
            %backend_label,
            width = info.width,
            height = info.height,
            fps,
            resumed = request.resume_sequence,
            "capture started"
        );
        self.publish_report();

        Ok(StartedReply {
            session: info,
            route: kind.route(),
            backend_label,
            skipped,
            frame_seq: self.frame_seq,
        })
    }

    /// Stops the native session; returns whether one was running
    async fn stop_session(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            if self.state != WorkerState::Idle {
                self.set_state(WorkerState::Idle);
                self.publish_report();
            }
            return false;
        };

        self.set_state(WorkerState::Stopping);
        session.cancel.cancel();
        self.session_cancel.lock().take();
        if let Some(job) = self.pending_preview.take() {
            job.abort();
        }

        let native_session_id = session.info.native_session_id;
        match AssertUnwindSafe(session.backend.stop_capture(native_session_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(native_session_id, "stop_capture failed, ignoring: {error}"),
            Err(_) => warn!(native_session_id, "capture backend panicked during stop"),
        }

        self.reset_counters();
        self.set_state(WorkerState::Idle);
        self.emit(WorkerMessage::Log {
            level:   LogLevel::Info,
            message: format!("capture stopped on {}", session.backend_label),
        });
        info!(backend = %session.backend_label, frame_seq = self.frame_seq, "capture stopped");
        self.publish_report();
        true
    }

    fn reset_counters(&mut self) {
        self.read_failures = 0;
        self.no_frame_streak = 0;
        self.fallback_recommended = false;
        self.backend_error = None;
        self.perf = PumpPerf::default();
        self.last_frame = None;
        self.last_frame_at = None;
        self.last_frame_at_ms = None;
        self.latest_preview = None;
    }

    fn bind_shared(&mut self, buffer: SharedFrameBuffer) -> CaptureResult<WorkerReply> {
        if self.session.is_none() {
            return Err(CaptureError::InvalidSession {
                native_session_id: 0,
            });
        }
        if let Some(frame) = &self.last_frame {
            buffer.publish(frame.seq, &frame.meta(), &frame.bytes)?;
        }
        let capacity = buffer.capacity();
        self.shared = Some(buffer);
        info!(capacity, "shared frame region bound");
        Ok(WorkerReply::Bound { capacity })
    }

    // ========== Pump ==========

    async fn pump_tick(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let backend = Arc::clone(&session.backend);
        let native_session_id = session.info.native_session_id;
        let read_timeout = session.read_timeout;
        let pump_interval = session.pump_interval;
        let cancel = session.cancel.clone();

        let (outcome, read_elapsed) = time_async(
            AssertUnwindSafe(backend.read_frame(native_session_id, read_timeout)).catch_unwind(),
        )
        .await;
        if cancel.is_cancelled() {
            trace!(native_session_id, "discarding read that finished after stop");
            if let Some(session) = self.session.as_mut() {
                session.next_tick = Instant::now() + pump_interval;
            }
            return;
        }
        let outcome = outcome.unwrap_or_else(|_| {
            Err(CaptureError::ReadFailed {
                message: format!("{} panicked during read", backend.label()),
            })
        });
        self.perf.read_ms.update(millis(read_elapsed));

        let escalation = match outcome {
            Ok(raw) if !raw.is_empty() => {
                self.fallback_recommended |= raw.fallback_recommended;
                match self.accept_frame(raw, millis(pump_interval)) {
                    Ok(()) => None,
                    Err(error) => self.record_failure(error),
                }
            }
            Ok(raw) => {
                self.fallback_recommended |= raw.fallback_recommended;
                self.no_frame_streak += 1;
                None
            }
            Err(CaptureError::NoFrame) => {
                self.no_frame_streak += 1;
                None
            }
            Err(error) => self.record_failure(error),
        };
        self.collect_preview();

        match escalation {
            Some(error) => self.escalate(error),
            None => {
                let delay = pump_interval + Duration::from_millis(backoff_ms(self.no_frame_streak));
                if let Some(session) = self.session.as_mut() {
                    session.next_tick = Instant::now() + delay;
                }
            }
        }
        self.publish_report();
    }

    /// Copies a frame through the staging buffer and publishes it
    fn accept_frame(&mut self, raw: RawFrame, expected_interval_ms: f64) -> CaptureResult<()> {
        let Some(session_format) = self.session.as_ref().map(|s| s.info.pixel_format) else {
            return Ok(());
        };
        let pixel_format = raw.pixel_format.unwrap_or(session_format);
        let payload = payload_bytes(raw.width, raw.height);
        if payload > MAX_FRAME_BYTES {
            return Err(CaptureError::FrameTooLarge {
                byte_length: payload,
                limit:       MAX_FRAME_BYTES,
            });
        }
        // padded rows are copied as-is
        let byte_length = raw.stride as usize * raw.height as usize;
        if byte_length > MAX_REGION_BYTES {
            return Err(CaptureError::FrameTooLarge {
                byte_length,
                limit: MAX_REGION_BYTES,
            });
        }
        if u64::from(raw.stride) < u64::from(raw.width) * 4 || raw.bytes.len() < byte_length {
            return Err(CaptureError::ReadFailed {
                message: format!(
                    "frame layout {}x{} stride {} does not fit {} bytes",
                    raw.width,
                    raw.height,
                    raw.stride,
                    raw.bytes.len()
                ),
            });
        }

        let ((), copy_elapsed) = time_sync(|| {
            if self.frame_buffer.len() < byte_length {
                self.frame_buffer.resize(byte_length, 0);
            }
            self.frame_buffer[..byte_length].copy_from_slice(&raw.bytes[..byte_length]);
        });
        self.perf.copy_ms.update(millis(copy_elapsed));

        self.frame_seq += 1;
        let now = Instant::now();
        let timestamp_ms = if raw.timestamp_ms > 0 {
            raw.timestamp_ms
        } else {
            epoch_ms()
        };
        let frame = Frame {
            seq: self.frame_seq,
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            pixel_format,
            timestamp_ms,
            bytes: Bytes::copy_from_slice(&self.frame_buffer[..byte_length]),
        };

        if let Some(shared) = &self.shared {
            let staged = &self.frame_buffer[..byte_length];
            let (published, elapsed) = time_sync(|| shared.publish(frame.seq, &frame.meta(), staged));
            self.perf.shared_write_ms.update(millis(elapsed));
            published?;
        }
        self.push.publish(frame.clone());
        self.maybe_encode_preview(&frame, now);

        self.perf.record_frame(now.into_std(), byte_length, expected_interval_ms);
        self.no_frame_streak = 0;
        self.read_failures = 0;
        self.last_frame_at = Some(now);
        self.last_frame_at_ms = Some(epoch_ms());
        trace!(seq = frame.seq, byte_length, "frame published");
        self.last_frame = Some(frame);
        Ok(())
    }

    /// Counts a failed read; returns the error if it must escalate
    fn record_failure(&mut self, error: CaptureError) -> Option<CaptureError> {
        self.no_frame_streak += 1;
        self.read_failures += 1;
        self.backend_error = Some(error.to_failure());

        if error.reason().is_hard_fallback() || self.read_failures >= self.read_failure_limit {
            Some(error)
        } else {
            debug!(
                read_failures = self.read_failures,
                reason = %error.reason(),
                "frame read failed: {error}"
            );
            None
        }
    }

    /// Stops ticking and reports the failure upward
    fn escalate(&mut self, error: CaptureError) {
        warn!(
            reason = %error.reason(),
            read_failures = self.read_failures,
            "capture failing, waiting for coordinator: {error}"
        );
        self.set_state(WorkerState::Error);
        if let Some(shared) = &self.shared {
            shared.mark_failed();
        }
        self.emit(WorkerMessage::Error(error.to_failure()));
    }

    // ========== Preview ==========

    fn maybe_encode_preview(&mut self, frame: &Frame, now: Instant) {
        self.collect_preview();
        if self.pending_preview.is_some() || !self.preview.should_encode(frame.seq, now.into_std()) {
            return;
        }

        let (max_width, max_height) = self.preview.max_size();
        let quality = self.preview.quality();
        let frame = frame.clone();
        self.pending_preview = Some(tokio::task::spawn_blocking(move || {
            let (image, elapsed) = time_sync(|| render_preview(&frame, max_width, max_height, quality));
            (frame.seq, image, elapsed)
        }));
    }

    /// Folds a finished preview encode into the tuning state
    fn collect_preview(&mut self) {
        if !self
            .pending_preview
            .as_ref()
            .is_some_and(|job| job.is_finished())
        {
            return;
        }
        let Some(job) = self.pending_preview.take() else {
            return;
        };

        match job.now_or_never() {
            Some(Ok((seq, Ok(image), elapsed))) => {
                let encode_ms = millis(elapsed);
                self.perf.preview_encode_ms.update(encode_ms);
                let action = self
                    .preview
                    .record_encode(seq, Instant::now().into_std(), encode_ms);
                trace!(seq, encode_ms, ?action, "preview encoded");
                self.latest_preview = Some(image);
            }
            Some(Ok((_, Err(error), _))) => self.preview.disable(error.to_string()),
            Some(Err(error)) => self.preview.disable(format!("preview encoder crashed: {error}")),
            None => {}
        }
        self.perf.preview_dropped_by_backpressure = self.preview.dropped_by_backpressure();
    }

    fn read_preview(&mut self) -> CaptureResult<WorkerReply> {
        self.collect_preview();
        if !self.preview.is_enabled() {
            return Err(CaptureError::PreviewUnavailable {
                reason: self
                    .preview
                    .status()
                    .disabled_reason
                    .unwrap_or_else(|| "preview disabled".to_string()),
            });
        }
        Ok(WorkerReply::Preview(self.latest_preview.clone()))
    }

    async fn read_native_preview(&mut self) -> CaptureResult<PreviewImage> {
        let Some(session) = self.session.as_ref() else {
            return Err(CaptureError::PreviewUnavailable {
                reason: "no active capture session".to_string(),
            });
        };
        if !session.backend.capabilities().can_read_compressed {
            return Err(CaptureError::PreviewUnavailable {
                reason: format!("{} has no compressed preview", session.backend_label),
            });
        }
        let backend = Arc::clone(&session.backend);
        let native_session_id = session.info.native_session_id;
        let timeout = session.read_timeout;

        let compressed = AssertUnwindSafe(backend.read_compressed_frame(native_session_id, timeout))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(CaptureError::PreviewUnavailable {
                    reason: format!("{} panicked during compressed read", backend.label()),
                })
            })?;

        Ok(PreviewImage {
            seq:       self.frame_seq,
            width:     compressed.width,
            height:    compressed.height,
            quality:   0,
            mime_type: compressed.mime_type,
            data:      STANDARD.encode(compressed.bytes),
        })
    }

    // ========== Reporting ==========

    fn frame_status(&self) -> FrameStatus {
        FrameStatus {
            frame_seq:        self.frame_seq,
            last_frame_at_ms: self.last_frame_at_ms,
            meta:             self.last_frame.as_ref().map(Frame::meta),
            has_frame:        self.last_frame.is_some(),
            backend_error:    self.backend_error.clone(),
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state:                self.state,
            frames:               self.frame_status(),
            route:                self.session.as_ref().map(|s| s.route),
            backend_label:        self.session.as_ref().map(|s| s.backend_label.clone()),
            read_failures:        self.read_failures,
            no_frame_streak:      self.no_frame_streak,
            fallback_recommended: self.fallback_recommended,
            shared_bound:         self.shared.is_some(),
            perf:                 self.perf.snapshot(),
            preview:              self.preview.status(),
        }
    }

    fn publish_report(&self) {
        self.reports.send_replace(PumpReport {
            generation:           self.generation,
            state:                self.state,
            route:                self.session.as_ref().map(|s| s.route),
            frame_seq:            self.frame_seq,
            started_at:           self.session.as_ref().map(|s| s.started_at),
            last_frame_at:        self.last_frame_at,
            read_failures:        self.read_failures,
            no_frame_streak:      self.no_frame_streak,
            last_failure:         self.backend_error.clone(),
            fallback_recommended: self.fallback_recommended,
            perf:                 self.perf.snapshot(),
        });
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            trace!(from = self.state.as_str(), to = state.as_str(), "worker state");
            self.state = state;
        }
    }

    fn emit(&self, message: WorkerMessage) {
        // no subscribers is fine
        let _ = self.events.send(message);
    }
}

fn validate_session(info: &CaptureSessionInfo) -> CaptureResult<()> {
    if info.width == 0 || info.height == 0 || u64::from(info.stride) < u64::from(info.width) * 4 {
        return Err(CaptureError::StartFailed {
            message: format!(
                "backend reported an invalid layout {}x{} stride {}",
                info.width, info.height, info.stride
            ),
        });
    }
    let pixels = u64::from(info.width) * u64::from(info.height);
    if pixels > MAX_CAPTURE_PIXELS {
        return Err(CaptureError::FrameTooLarge {
            byte_length: payload_bytes(info.width, info.height),
            limit:       MAX_FRAME_BYTES,
        });
    }
    Ok(())
}

fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
