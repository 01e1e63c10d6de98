//! Shared test utilities for integration tests

use std::{sync::Arc, time::Duration};

use hdr_capture_bridge::{
    capture::{BackendKind, BackendRegistry, StaticBackendLoader, SyntheticBackend, constants::BridgeConfig},
    coordinator::{Coordinator, SessionEvent},
    transport::FrameServer,
};
use tokio::sync::broadcast;

/// Synthetic wgc and legacy backends, kept so tests can inspect them
pub struct Harness {
    pub wgc:         Arc<SyntheticBackend>,
    pub legacy:      Arc<SyntheticBackend>,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new(wgc: SyntheticBackend, legacy: SyntheticBackend) -> Self {
        let wgc = Arc::new(wgc);
        let legacy = Arc::new(legacy);
        let loader = StaticBackendLoader::new()
            .with_backend(BackendKind::Wgc, wgc.clone())
            .with_backend(BackendKind::Legacy, legacy.clone());
        let coordinator = Coordinator::new(Arc::new(BackendRegistry::new(loader)), BridgeConfig::default());
        Self {
            wgc,
            legacy,
            coordinator,
        }
    }

    pub fn healthy() -> Self {
        Self::new(SyntheticBackend::new("wgc"), SyntheticBackend::new("legacy"))
    }

    /// Same backends with a loopback frame server attached
    pub async fn with_http(wgc: SyntheticBackend, legacy: SyntheticBackend) -> (Self, Arc<FrameServer>) {
        let server = Arc::new(FrameServer::start(0).await.expect("frame server binds"));
        let mut harness = Self::new(wgc, legacy);
        harness.coordinator = harness.coordinator.with_frame_server(Arc::clone(&server));
        (harness, server)
    }
}

/// Waits for the next fallback or degrade event
pub async fn next_transition(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    let wait = async {
        loop {
            match events.recv().await.expect("event channel open") {
                event @ (SessionEvent::Fallback { .. } | SessionEvent::Degraded { .. }) => return event,
                _ => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("transition within 10s")
}
