//! Session coordinator
//!
//! The coordinator owns every transport session: it picks a backend, probes
//! it, starts a worker, negotiates the transport and then supervises the
//! worker's pump reports for fallback triggers.
//!
//! Fallback is transparent to the consumer. A wgc session that trips a
//! trigger is restarted on the legacy backend in the same worker with the
//! same source and display; the frame sequence continues and the transport
//! binding stays valid. If that is not possible the session moves to the
//! builtin desktop tier for the rest of its life.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use hdr_capture_bridge::{
//!     capture::{BackendKind, BackendRegistry, StaticBackendLoader, SyntheticBackend,
//!               constants::BridgeConfig},
//!     coordinator::{Coordinator, SessionOptions},
//!     model::{RuntimeRoute, StartRequest, TransportMode},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let loader = StaticBackendLoader::new()
//!         .with_backend(BackendKind::Wgc, Arc::new(SyntheticBackend::new("wgc")))
//!         .with_backend(BackendKind::Legacy, Arc::new(SyntheticBackend::new("legacy")));
//!     let coordinator = Coordinator::new(Arc::new(BackendRegistry::new(loader)), BridgeConfig::default());
//!
//!     let started = coordinator
//!         .start_session(SessionOptions::new(StartRequest::new("screen:0", 60)))
//!         .await
//!         .unwrap();
//!     assert_eq!(started.route, RuntimeRoute::WgcV1);
//!     assert_eq!(started.transport_mode, TransportMode::SharedBuffer);
//!
//!     assert!(coordinator.stop_session(&started.session_id).await);
//!     assert!(!coordinator.stop_session(&started.session_id).await);
//! }
//! ```

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capture::{
        BackendKind, BackendRegistry, Selection,
        constants::BridgeConfig,
        select_backend,
        selector::{MappingDecision, MappingInput, MappingRoute, SelectionSummary, resolve_mapping_decision},
    },
    error::{CaptureError, CaptureResult, Failure},
    model::{
        MappingMode, PreviewImage, RouteAvailability, RoutePreference, RuntimeRoute, StartRequest,
        TransportMode,
    },
    preview::PreviewConfig,
    transport::{
        ConsumerCapabilities, FrameServer, NegotiationParams, TransportBinding, negotiate,
    },
    worker::{PumpReport, WorkerHandle, WorkerOptions, protocol::StartedReply, spawn_worker},
};

pub mod diagnostics;
pub mod fallback;
pub mod trace;

pub use diagnostics::{DiagnosticsSnapshot, SessionPhase};
pub use fallback::{FallbackAction, FallbackTrigger, TriggerLimits, detect_trigger, plan_fallback};
pub use trace::{TraceEntry, TraceKind, TraceRing};

/// How often the supervisor re-checks the idle budget between reports
const SUPERVISOR_POLL: Duration = Duration::from_millis(100);

const EVENT_QUEUE: usize = 64;

/// Everything needed to start one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub request:      StartRequest,
    pub mapping_mode: MappingMode,
    pub consumer:     ConsumerCapabilities,
    pub preview:      PreviewConfig,
}

impl SessionOptions {
    pub fn new(request: StartRequest) -> Self {
        Self {
            request,
            mapping_mode: MappingMode::Auto,
            consumer: ConsumerCapabilities::default(),
            preview: PreviewConfig::default(),
        }
    }

    pub fn with_mapping_mode(mut self, mode: MappingMode) -> Self {
        self.mapping_mode = mode;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerCapabilities) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_preview(mut self, preview: PreviewConfig) -> Self {
        self.preview = preview;
        self
    }
}

/// What the caller gets back from [`Coordinator::start_session`]
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub session_id:       String,
    pub route:            RuntimeRoute,
    pub backend_label:    String,
    pub decision:         MappingDecision,
    pub transport_mode:   TransportMode,
    pub transport_reason: Option<String>,
    pub binding:          TransportBinding,
}

impl StartedSession {
    /// Pull URL when the session uses the HTTP fallback
    pub fn frame_url(&self) -> Option<&str> {
        match &self.binding {
            TransportBinding::Http { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// Lifecycle notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        session_id: String,
        route:      RuntimeRoute,
    },
    /// Restarted on a lower native tier
    Fallback {
        session_id: String,
        from:       RuntimeRoute,
        to:         RuntimeRoute,
        reason:     String,
    },
    /// Left native capture for the builtin desktop tier
    Degraded { session_id: String, reason: String },
    Stopped { session_id: String },
}

struct SessionState {
    phase:                  SessionPhase,
    route:                  RuntimeRoute,
    backend_label:          String,
    /// Worker generation the supervisor is watching
    generation:             u64,
    legacy_retry_attempted: bool,
    fallback_attempts:      u32,
    degraded:               bool,
    transport_mode:         TransportMode,
    transport_reason:       Option<String>,
    http_token:             Option<String>,
    bind_attempts:          u32,
    bind_failures:          u32,
    last_error:             Option<Failure>,
    trace:                  TraceRing,
}

impl SessionState {
    fn record(&mut self, kind: TraceKind, reason: impl Into<String>) {
        let route = self.route;
        let attempt = self.fallback_attempts;
        self.trace.push(kind, route, reason, attempt);
    }
}

struct Session {
    id:         String,
    request:    StartRequest,
    /// `None` for sessions that never went native
    worker:     Option<WorkerHandle>,
    state:      Mutex<SessionState>,
    cancel:     CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Shared pieces the supervisor needs without holding the coordinator
#[derive(Clone)]
struct SupervisorContext {
    limits: TriggerLimits,
    http:   Option<Arc<FrameServer>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Owner of all transport sessions
pub struct Coordinator {
    registry:       Arc<BackendRegistry>,
    config:         BridgeConfig,
    http:           Option<Arc<FrameServer>>,
    sessions:       RwLock<HashMap<String, Arc<Session>>>,
    next_worker_id: AtomicU64,
    events:         broadcast::Sender<SessionEvent>,
}

impl Coordinator {
    pub fn new(registry: Arc<BackendRegistry>, config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            registry,
            config,
            http: None,
            sessions: RwLock::new(HashMap::new()),
            next_worker_id: AtomicU64::new(1),
            events,
        }
    }

    /// Enables the HTTP fallback for out-of-process consumers
    pub fn with_frame_server(mut self, server: Arc<FrameServer>) -> Self {
        self.http = Some(server);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn frame_server(&self) -> Option<&FrameServer> {
        self.http.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Runs backend selection only, with the configured availability
    pub fn select(&self, preference: RoutePreference) -> SelectionSummary {
        select_backend(&self.registry, preference, self.config.availability).summary()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Selects, probes and starts a session, then negotiates its transport
    ///
    /// # Errors
    ///
    /// - [`CaptureError::RouteBlocked`] when the mapping mode is
    ///   `force-native` and native capture is not possible
    ///
    /// Every other failure on the way degrades to the builtin desktop tier
    /// instead of failing the call.
    pub async fn start_session(&self, options: SessionOptions) -> CaptureResult<StartedSession> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let mut request = options.request.clone();
        request.availability = RouteAvailability {
            wgc_enabled:    request.availability.wgc_enabled && self.config.availability.wgc_enabled,
            legacy_enabled: request.availability.legacy_enabled && self.config.availability.legacy_enabled,
        };
        let mut trace = TraceRing::default();

        debug!(%session_id, phase = SessionPhase::Selecting.as_str(), source = %request.source_id);
        let selection = select_backend(&self.registry, request.route_preference, request.availability);
        let summary = selection.summary();
        trace.push(
            TraceKind::Selected,
            summary.route,
            summary.reason.clone().unwrap_or_else(|| summary.backend_label.clone()),
            0,
        );

        let mut input = MappingInput {
            mode: options.mapping_mode,
            native_route_enabled: selection.is_native(),
            native_route_reason: match &selection {
                Selection::Builtin { reason } => Some(reason.clone()),
                Selection::Native { .. } => None,
            },
            ..MappingInput::default()
        };
        if let Selection::Native { backend, .. } = &selection {
            if options.mapping_mode != MappingMode::Off {
                let probe = AssertUnwindSafe(backend.probe(&request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(CaptureError::NativeUnavailable {
                            message: "backend panicked during probe".to_string(),
                        })
                    });
                match probe {
                    Ok(probe) => {
                        input.probe_supported = probe.supported;
                        input.hdr_active = probe.hdr_active;
                        input.probe_reason = Some(probe.reason);
                    }
                    Err(error) => input.probe_reason = Some(error.reason().as_str().to_string()),
                }
            }
        }

        let decision = resolve_mapping_decision(&input);
        match decision.route {
            MappingRoute::Blocked => {
                warn!(%session_id, reason = %decision.reason, "capture route blocked");
                return Err(CaptureError::RouteBlocked {
                    reason: decision.reason,
                });
            }
            MappingRoute::Fallback => {
                return Ok(self.register_builtin(session_id, request, decision, trace));
            }
            MappingRoute::Native => {}
        }

        debug!(%session_id, phase = SessionPhase::Starting.as_str(), route = %summary.route);
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = spawn_worker(
            Arc::clone(&self.registry),
            WorkerOptions {
                preview: options.preview,
                ..WorkerOptions::from_config(worker_id, &self.config)
            },
        );

        let mut legacy_retry_attempted = false;
        let mut fallback_attempts = 0;
        let started = match worker.start_capture(request.clone()).await {
            Err(error) if summary.route == RuntimeRoute::WgcV1 && request.availability.legacy_enabled => {
                warn!(%session_id, reason = %error.reason(), "wgc start failed, retrying on legacy: {error}");
                trace.push(TraceKind::StartFailed, RuntimeRoute::WgcV1, error.reason().as_str(), 0);
                legacy_retry_attempted = true;
                fallback_attempts = 1;
                worker.start_capture(legacy_request(&request, false)).await
            }
            other => other,
        };

        input.native_start = Some(match &started {
            Ok(_) => Ok(()),
            Err(error) => Err(error.reason().as_str().to_string()),
        });
        let decision = resolve_mapping_decision(&input);
        let started = match (decision.route, started) {
            (MappingRoute::Native, Ok(started)) => started,
            (route, _) => {
                worker.shutdown().await;
                if route == MappingRoute::Blocked {
                    warn!(%session_id, reason = %decision.reason, "capture route blocked");
                    return Err(CaptureError::RouteBlocked {
                        reason: decision.reason,
                    });
                }
                trace.push(TraceKind::StartFailed, summary.route, decision.reason.clone(), fallback_attempts);
                return Ok(self.register_builtin(session_id, request, decision, trace));
            }
        };
        trace.push(TraceKind::Started, started.route, decision.reason.clone(), fallback_attempts);

        let negotiated = negotiate(
            &worker,
            NegotiationParams {
                consumer:                 options.consumer,
                frame_bytes:              frame_bytes(&started),
                bind_timeout:             Duration::from_millis(self.config.bind_timeout_ms),
                http:                     self.http.as_deref(),
                native_preview_available: self.native_preview_available(started.route),
            },
        )
        .await;
        trace.push(
            TraceKind::Transport,
            started.route,
            negotiated
                .reason
                .clone()
                .unwrap_or_else(|| negotiated.mode.as_str().to_string()),
            fallback_attempts,
        );

        let http_token = match &negotiated.binding {
            TransportBinding::Http { token, .. } => Some(token.clone()),
            _ => None,
        };
        let generation = worker.report().generation;
        let session = Arc::new(Session {
            id: session_id.clone(),
            request,
            worker: Some(worker),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Running,
                route: started.route,
                backend_label: started.backend_label.clone(),
                generation,
                legacy_retry_attempted,
                fallback_attempts,
                degraded: false,
                transport_mode: negotiated.mode,
                transport_reason: negotiated.reason.clone(),
                http_token,
                bind_attempts: negotiated.bind_attempts,
                bind_failures: negotiated.bind_failures,
                last_error: None,
                trace,
            }),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        let context = SupervisorContext {
            limits: TriggerLimits {
                read_failure_limit: self.config.read_failure_limit,
                stall_idle:         Duration::from_millis(self.config.stall_idle_ms),
            },
            http:   self.http.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(supervise(Arc::clone(&session), context));
        *session.supervisor.lock() = Some(task);
        self.sessions.write().insert(session_id.clone(), session);

        info!(
            %session_id,
            route = %started.route,
            backend = %started.backend_label,
            transport = %negotiated.mode,
            "capture session started"
        );
        self.emit(SessionEvent::Started {
            session_id: session_id.clone(),
            route:      started.route,
        });

        Ok(StartedSession {
            session_id,
            route: started.route,
            backend_label: started.backend_label,
            decision,
            transport_mode: negotiated.mode,
            transport_reason: negotiated.reason,
            binding: negotiated.binding,
        })
    }

    /// Stops a session and releases its worker and transport
    ///
    /// Returns whether the session existed. Unknown or already stopped ids
    /// are not an error.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(session_id) else {
            debug!(%session_id, "stop for unknown session ignored");
            return false;
        };

        session.cancel.cancel();
        let supervisor = session.supervisor.lock().take();
        if let Some(task) = supervisor {
            task.abort();
            let _ = task.await;
        }

        if let Some(worker) = &session.worker {
            if let Err(e) = worker.stop_capture().await {
                debug!(%session_id, "worker stop failed, shutting it down anyway: {e}");
            }
            worker.shutdown().await;
        }

        {
            let mut state = session.state.lock();
            if let (Some(token), Some(server)) = (state.http_token.take(), &self.http) {
                server.unregister(&token);
            }
            state.phase = SessionPhase::Stopped;
            state.record(TraceKind::Stopped, "STOPPED");
        }
        info!(%session_id, "capture session stopped");
        self.emit(SessionEvent::Stopped {
            session_id: session_id.to_string(),
        });
        true
    }

    /// Stops every session
    pub async fn shutdown(&self) {
        for session_id in self.session_ids() {
            self.stop_session(&session_id).await;
        }
    }

    /// Snapshot of one session, `None` for unknown ids
    pub fn diagnostics(&self, session_id: &str) -> Option<DiagnosticsSnapshot> {
        let session = self.sessions.read().get(session_id).cloned()?;
        let report = session
            .worker
            .as_ref()
            .map(WorkerHandle::report)
            .unwrap_or_default();
        let state = session.state.lock();

        Some(DiagnosticsSnapshot {
            session_id:             session.id.clone(),
            phase:                  state.phase,
            runtime_route:          state.route,
            fallback_level:         state.route.fallback_level(),
            backend_label:          state.backend_label.clone(),
            transport_mode:         state.transport_mode,
            transport_reason:       state.transport_reason.clone(),
            transport_degraded:     state.degraded,
            frame_seq:              report.frame_seq,
            read_failures:          report.read_failures,
            no_frame_streak:        report.no_frame_streak,
            bind_attempts:          state.bind_attempts,
            bind_failures:          state.bind_failures,
            fallback_attempts:      state.fallback_attempts,
            legacy_retry_attempted: state.legacy_retry_attempted,
            last_error:             state.last_error.clone(),
            perf:                   report.perf,
            trace:                  state.trace.snapshot(),
        })
    }

    /// Latest adaptive preview of a native session
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidParameter`] for an unknown session
    /// - [`CaptureError::PreviewUnavailable`] once the session left native
    ///   capture or the preview path was disabled
    pub async fn read_preview(&self, session_id: &str) -> CaptureResult<Option<PreviewImage>> {
        let session = self.session(session_id)?;
        if session.state.lock().degraded {
            return Err(CaptureError::PreviewUnavailable {
                reason: "session runs on the builtin desktop tier".to_string(),
            });
        }
        match &session.worker {
            Some(worker) => worker.read_preview().await,
            None => Err(CaptureError::PreviewUnavailable {
                reason: "session never started native capture".to_string(),
            }),
        }
    }

    /// Changes the preview settings of a running session
    pub async fn configure_preview(&self, session_id: &str, config: PreviewConfig) -> CaptureResult<()> {
        let session = self.session(session_id)?;
        match &session.worker {
            Some(worker) => worker.configure_preview(config).await.map(|_| ()),
            None => Err(CaptureError::PreviewUnavailable {
                reason: "session never started native capture".to_string(),
            }),
        }
    }

    fn session(&self, session_id: &str) -> CaptureResult<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CaptureError::InvalidParameter {
                parameter: "session_id".to_string(),
                reason:    format!("unknown session '{session_id}'"),
            })
    }

    fn native_preview_available(&self, route: RuntimeRoute) -> bool {
        BackendKind::from_route(route)
            .and_then(|kind| self.registry.resolve(kind).ok())
            .is_some_and(|backend| backend.capabilities().can_read_compressed)
    }

    fn register_builtin(
        &self,
        session_id: String,
        request: StartRequest,
        decision: MappingDecision,
        mut trace: TraceRing,
    ) -> StartedSession {
        info!(%session_id, reason = %decision.reason, "capture session on builtin desktop tier");
        trace.push(TraceKind::Degraded, RuntimeRoute::BuiltinDesktop, decision.reason.clone(), 0);

        let session = Arc::new(Session {
            id: session_id.clone(),
            request,
            worker: None,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Running,
                route: RuntimeRoute::BuiltinDesktop,
                backend_label: String::new(),
                generation: 0,
                legacy_retry_attempted: false,
                fallback_attempts: 0,
                degraded: false,
                transport_mode: TransportMode::NativePreviewStream,
                transport_reason: Some(decision.reason.clone()),
                http_token: None,
                bind_attempts: 0,
                bind_failures: 0,
                last_error: None,
                trace,
            }),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });
        self.sessions.write().insert(session_id.clone(), session);
        self.emit(SessionEvent::Started {
            session_id: session_id.clone(),
            route:      RuntimeRoute::BuiltinDesktop,
        });

        StartedSession {
            session_id,
            route: RuntimeRoute::BuiltinDesktop,
            backend_label: String::new(),
            transport_mode: TransportMode::NativePreviewStream,
            transport_reason: Some(decision.reason.clone()),
            decision,
            binding: TransportBinding::NativePreview,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("http", &self.http.as_ref().map(|server| server.local_addr()))
            .finish()
    }
}

fn frame_bytes(started: &StartedReply) -> usize {
    started.session.stride as usize * started.session.height as usize
}

/// Same capture pinned to the legacy backend
fn legacy_request(request: &StartRequest, resume_sequence: bool) -> StartRequest {
    let mut legacy = request
        .clone()
        .with_route(RoutePreference::Legacy)
        .with_availability(RouteAvailability {
            wgc_enabled:    false,
            legacy_enabled: request.availability.legacy_enabled,
        });
    legacy.resume_sequence = resume_sequence;
    legacy
}

// ========== Supervisor ==========

async fn supervise(session: Arc<Session>, context: SupervisorContext) {
    let Some(worker) = session.worker.as_ref() else {
        return;
    };
    let mut reports = worker.reports();
    let mut poll = tokio::time::interval(SUPERVISOR_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let exited = tokio::select! {
            _ = session.cancel.cancelled() => return,
            changed = reports.changed() => changed.is_err(),
            _ = poll.tick() => false,
        };

        let report = reports.borrow_and_update().clone();
        let trigger = if exited || !worker.is_alive() {
            Some(FallbackTrigger::WorkerExited)
        } else if report.generation == session.state.lock().generation {
            detect_trigger(&report, Instant::now(), context.limits)
        } else {
            None
        };

        if let Some(trigger) = trigger {
            if !handle_trigger(&session, worker, &context, trigger, &report).await {
                return;
            }
        }
    }
}

/// Applies one fallback step; returns whether supervision continues
async fn handle_trigger(
    session: &Session,
    worker: &WorkerHandle,
    context: &SupervisorContext,
    trigger: FallbackTrigger,
    report: &PumpReport,
) -> bool {
    let reason = trigger.reason();
    let (route, action) = {
        let mut state = session.state.lock();
        state.phase = SessionPhase::Degrading;
        state.fallback_attempts += 1;
        state.last_error = report.last_failure.clone();
        state.record(TraceKind::Fallback, reason.clone());
        let action = if trigger == FallbackTrigger::WorkerExited {
            FallbackAction::Builtin
        } else {
            plan_fallback(
                state.route,
                state.legacy_retry_attempted,
                session.request.availability.legacy_enabled,
            )
        };
        if action == FallbackAction::RetryLegacy {
            state.legacy_retry_attempted = true;
        }
        (state.route, action)
    };
    warn!(session_id = %session.id, %route, %reason, ?trigger, "fallback triggered");

    let mut final_reason = reason;
    if action == FallbackAction::RetryLegacy {
        match worker.start_capture(legacy_request(&session.request, true)).await {
            Ok(started) => {
                let generation = worker.report().generation;
                {
                    let mut state = session.state.lock();
                    state.route = started.route;
                    state.backend_label = started.backend_label.clone();
                    state.generation = generation;
                    state.phase = SessionPhase::Running;
                    state.record(TraceKind::Started, final_reason.clone());
                }
                info!(
                    session_id = %session.id,
                    from = %route,
                    to = %started.route,
                    frame_seq = started.frame_seq,
                    "capture restarted on legacy backend"
                );
                let _ = context.events.send(SessionEvent::Fallback {
                    session_id: session.id.clone(),
                    from:       route,
                    to:         started.route,
                    reason:     final_reason,
                });
                return true;
            }
            Err(error) => {
                warn!(session_id = %session.id, "legacy restart failed: {error}");
                final_reason = error.reason().as_str().to_string();
                let mut state = session.state.lock();
                state.last_error = Some(error.to_failure());
                state.record(TraceKind::StartFailed, final_reason.clone());
            }
        }
    }

    degrade_to_builtin(session, worker, context, final_reason).await;
    false
}

async fn degrade_to_builtin(session: &Session, worker: &WorkerHandle, context: &SupervisorContext, reason: String) {
    if let Err(e) = worker.stop_capture().await {
        debug!(session_id = %session.id, "native stop during degrade failed: {e}");
    }
    {
        let mut state = session.state.lock();
        if let (Some(token), Some(server)) = (state.http_token.take(), &context.http) {
            server.unregister(&token);
        }
        state.route = RuntimeRoute::BuiltinDesktop;
        state.backend_label = String::new();
        state.transport_mode = TransportMode::NativePreviewStream;
        state.transport_reason = Some(reason.clone());
        state.degraded = true;
        state.phase = SessionPhase::Running;
        state.record(TraceKind::Degraded, reason.clone());
    }
    warn!(session_id = %session.id, %reason, "capture degraded to builtin desktop tier");
    let _ = context.events.send(SessionEvent::Degraded {
        session_id: session.id.clone(),
        reason,
    });
}
