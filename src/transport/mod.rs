//! Frame transports and their negotiation
//!
//! Three ways to move frames from the worker to a consumer, fastest first:
//!
//! - [`shared`]: shared region + atomic control block, lock-free polling
//! - [`push`]: in-process latest-wins slot
//! - [`http`]: loopback `GET /frame/{token}` endpoint
//!
//! A fourth mode, the native preview stream, carries only backend-encoded
//! preview images and is chosen when the consumer asks for it and the backend
//! can produce them.
//!
//! [`negotiate`] walks that ranking for one session and records why each
//! faster tier was passed over, so a transport downgrade is never mistaken
//! for a backend failure.

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{CaptureError, CaptureResult},
    model::TransportMode,
};

pub mod http;
pub mod push;
pub mod shared;

pub use http::FrameServer;
pub use push::{PushFrameReader, PushFrameSender};
pub use shared::{ReceivedFrame, SharedFrameBuffer, SharedFrameReader};

/// What the consuming environment can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCapabilities {
    /// Shared memory with atomics is available to the consumer
    pub shared_memory:         bool,
    /// The consumer may receive a shared region across its isolation boundary
    pub cross_origin_isolated: bool,
    /// Producer and consumer share one process
    pub same_process:          bool,
    /// The consumer only wants backend-encoded previews
    #[serde(default)]
    pub native_preview_only:   bool,
}

impl ConsumerCapabilities {
    /// A consumer that can bind the shared region
    pub fn shared() -> Self {
        Self {
            shared_memory:         true,
            cross_origin_isolated: true,
            same_process:          false,
            native_preview_only:   false,
        }
    }

    /// An in-process consumer without shared memory
    pub fn in_process() -> Self {
        Self {
            shared_memory:         false,
            cross_origin_isolated: false,
            same_process:          true,
            native_preview_only:   false,
        }
    }

    /// An out-of-process consumer that can only pull over HTTP
    pub fn remote() -> Self {
        Self {
            shared_memory:         false,
            cross_origin_isolated: false,
            same_process:          false,
            native_preview_only:   false,
        }
    }
}

impl Default for ConsumerCapabilities {
    fn default() -> Self {
        Self::shared()
    }
}

/// The producer side a transport attaches to
///
/// Implemented by the worker handle; the shared region must be installed in
/// the worker before frames flow through it.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Asks the producer to publish into `buffer` from now on
    async fn bind_shared(&self, buffer: SharedFrameBuffer) -> CaptureResult<()>;

    /// Latest-wins source that every published frame also lands in
    fn push_source(&self) -> PushFrameSender;
}

/// What a consumer holds after negotiation
#[derive(Debug, Clone)]
pub enum TransportBinding {
    Shared(SharedFrameBuffer),
    Push(PushFrameSender),
    Http { token: String, url: String },
    NativePreview,
}

/// Outcome of [`negotiate`]
#[derive(Debug, Clone)]
pub struct NegotiatedTransport {
    pub mode:          TransportMode,
    /// Why faster tiers were skipped; `None` when shared-buffer bound
    pub reason:        Option<String>,
    pub binding:       TransportBinding,
    pub bind_attempts: u32,
    pub bind_failures: u32,
}

/// Inputs to [`negotiate`] that do not change between renegotiations
#[derive(Debug, Clone, Copy)]
pub struct NegotiationParams<'a> {
    pub consumer:                 ConsumerCapabilities,
    /// Bytes per frame of the running session
    pub frame_bytes:              usize,
    pub bind_timeout:             Duration,
    pub http:                     Option<&'a FrameServer>,
    pub native_preview_available: bool,
}

/// Picks the fastest transport the consumer and producer agree on
///
/// Shared-buffer is attempted only when the consumer reports shared memory
/// and cross-origin isolation. A failed bind degrades to the push buffer for
/// in-process consumers, or to HTTP when a frame server is running. The
/// session itself is never torn down here.
pub async fn negotiate(sink: &dyn FrameSink, params: NegotiationParams<'_>) -> NegotiatedTransport {
    if params.consumer.native_preview_only && params.native_preview_available {
        info!("transport negotiated: native preview stream");
        return NegotiatedTransport {
            mode:          TransportMode::NativePreviewStream,
            reason:        Some("NATIVE_PREVIEW_REQUESTED".to_string()),
            binding:       TransportBinding::NativePreview,
            bind_attempts: 0,
            bind_failures: 0,
        };
    }

    let (bind, attempted) = bind_shared(sink, &params).await;
    let error = match bind {
        Ok(buffer) => {
            info!(capacity = buffer.capacity(), "transport negotiated: shared buffer");
            return NegotiatedTransport {
                mode:          TransportMode::SharedBuffer,
                reason:        None,
                binding:       TransportBinding::Shared(buffer),
                bind_attempts: 1,
                bind_failures: 0,
            };
        }
        Err(error) => error,
    };

    let reason = error.reason().to_string();
    warn!(%reason, "shared buffer unavailable: {error}");
    let bind_attempts = u32::from(attempted);
    let bind_failures = u32::from(attempted);

    let (mode, binding) = match params.http {
        Some(server) if !params.consumer.same_process => {
            let token = server.register(sink.push_source());
            let url = server.frame_url(&token);
            (TransportMode::HttpFallback, TransportBinding::Http { token, url })
        }
        _ => (TransportMode::PushBuffer, TransportBinding::Push(sink.push_source())),
    };
    info!(mode = mode.as_str(), %reason, "transport negotiated");

    NegotiatedTransport {
        mode,
        reason: Some(reason),
        binding,
        bind_attempts,
        bind_failures,
    }
}

/// Returns the bound region, or the error and whether a bind was attempted
async fn bind_shared(
    sink: &dyn FrameSink,
    params: &NegotiationParams<'_>,
) -> (CaptureResult<SharedFrameBuffer>, bool) {
    if !params.consumer.shared_memory {
        return (
            Err(CaptureError::BindRejected {
                reason: "consumer has no shared memory support".to_string(),
            }),
            false,
        );
    }
    if !params.consumer.cross_origin_isolated {
        return (Err(CaptureError::BindCloneBlocked), false);
    }

    let buffer = match SharedFrameBuffer::with_capacity(params.frame_bytes) {
        Ok(buffer) => buffer,
        Err(error) => return (Err(error), true),
    };
    debug!(capacity = buffer.capacity(), "binding shared frame region");

    let bound = tokio::time::timeout(params.bind_timeout, sink.bind_shared(buffer.clone())).await;
    let result = match bound {
        Ok(Ok(())) => Ok(buffer),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(CaptureError::BindTimeout {
            duration_ms: params.bind_timeout.as_millis() as u64,
        }),
    };
    (result, true)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::FailureReason;

    enum BindBehavior {
        Accept,
        Reject,
        Hang,
    }

    struct TestSink {
        behavior: BindBehavior,
        binds:    AtomicUsize,
        push:     PushFrameSender,
    }

    impl TestSink {
        fn new(behavior: BindBehavior) -> Self {
            Self {
                behavior,
                binds: AtomicUsize::new(0),
                push: PushFrameSender::new(),
            }
        }
    }

    #[async_trait]
    impl FrameSink for TestSink {
        async fn bind_shared(&self, _buffer: SharedFrameBuffer) -> CaptureResult<()> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                BindBehavior::Accept => Ok(()),
                BindBehavior::Reject => Err(CaptureError::BindRejected {
                    reason: "worker refused".to_string(),
                }),
                BindBehavior::Hang => std::future::pending().await,
            }
        }

        fn push_source(&self) -> PushFrameSender {
            self.push.clone()
        }
    }

    fn params(consumer: ConsumerCapabilities) -> NegotiationParams<'static> {
        NegotiationParams {
            consumer,
            frame_bytes: 1024,
            bind_timeout: Duration::from_millis(50),
            http: None,
            native_preview_available: false,
        }
    }

    #[tokio::test]
    async fn test_shared_buffer_preferred() {
        let sink = TestSink::new(BindBehavior::Accept);
        let negotiated = negotiate(&sink, params(ConsumerCapabilities::shared())).await;

        assert_eq!(negotiated.mode, TransportMode::SharedBuffer);
        assert!(negotiated.reason.is_none());
        assert_eq!(negotiated.bind_attempts, 1);
        assert!(matches!(negotiated.binding, TransportBinding::Shared(_)));
    }

    #[tokio::test]
    async fn test_no_shared_memory_never_attempts_bind() {
        let sink = TestSink::new(BindBehavior::Accept);
        let negotiated = negotiate(&sink, params(ConsumerCapabilities::in_process())).await;

        assert_eq!(sink.binds.load(Ordering::SeqCst), 0);
        assert_eq!(negotiated.mode, TransportMode::PushBuffer);
        assert_eq!(negotiated.reason.as_deref(), Some(FailureReason::BindRejected.as_str()));
        assert_eq!(negotiated.bind_attempts, 0);
    }

    #[tokio::test]
    async fn test_not_isolated_is_clone_blocked() {
        let sink = TestSink::new(BindBehavior::Accept);
        let consumer = ConsumerCapabilities {
            cross_origin_isolated: false,
            ..ConsumerCapabilities::shared()
        };
        let negotiated = negotiate(&sink, params(consumer)).await;

        assert_eq!(sink.binds.load(Ordering::SeqCst), 0);
        assert_eq!(negotiated.reason.as_deref(), Some("BIND_CLONE_BLOCKED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout_degrades() {
        let sink = TestSink::new(BindBehavior::Hang);
        let negotiated = negotiate(&sink, params(ConsumerCapabilities::shared())).await;

        assert_eq!(negotiated.reason.as_deref(), Some("BIND_TIMEOUT"));
        assert_eq!(negotiated.bind_attempts, 1);
        assert_eq!(negotiated.bind_failures, 1);
        assert_eq!(negotiated.mode, TransportMode::PushBuffer);
    }

    #[tokio::test]
    async fn test_rejected_bind_falls_back_to_http_for_remote_consumer() {
        let server = FrameServer::start(0).await.unwrap();
        let sink = TestSink::new(BindBehavior::Reject);
        let consumer = ConsumerCapabilities {
            same_process: false,
            ..ConsumerCapabilities::shared()
        };
        let negotiated = negotiate(
            &sink,
            NegotiationParams {
                http: Some(&server),
                ..params(consumer)
            },
        )
        .await;

        assert_eq!(negotiated.mode, TransportMode::HttpFallback);
        assert_eq!(negotiated.reason.as_deref(), Some("BIND_REJECTED"));
        match negotiated.binding {
            TransportBinding::Http { url, .. } => assert!(url.starts_with("http://127.0.0.1:")),
            other => panic!("expected http binding, got {other:?}"),
        }
        assert_eq!(server.stream_count(), 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_native_preview_only_when_available() {
        let sink = TestSink::new(BindBehavior::Accept);
        let consumer = ConsumerCapabilities {
            native_preview_only: true,
            ..ConsumerCapabilities::shared()
        };

        let without = negotiate(&sink, params(consumer)).await;
        assert_eq!(without.mode, TransportMode::SharedBuffer);

        let with = negotiate(
            &sink,
            NegotiationParams {
                native_preview_available: true,
                ..params(consumer)
            },
        )
        .await;
        assert_eq!(with.mode, TransportMode::NativePreviewStream);
    }
}
