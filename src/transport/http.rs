//! HTTP fallback transport
//!
//! A loopback axum server exposes the latest frame of each registered stream
//! at `GET /frame/{token}`. Consumers pass `?minSeq=N` to receive
//! `204 No Content` instead of a frame they already have.
//!
//! Frame metadata travels in `X-Hdr-Frame-Seq`, `X-Hdr-Width`,
//! `X-Hdr-Height`, `X-Hdr-Stride`, `X-Hdr-Pixel-Format` and
//! `X-Hdr-Timestamp-Ms` response headers; the body is the raw pixel bytes.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use super::push::PushFrameSender;
use crate::error::CaptureResult;

pub const HEADER_FRAME_SEQ: &str = "x-hdr-frame-seq";
pub const HEADER_WIDTH: &str = "x-hdr-width";
pub const HEADER_HEIGHT: &str = "x-hdr-height";
pub const HEADER_STRIDE: &str = "x-hdr-stride";
pub const HEADER_PIXEL_FORMAT: &str = "x-hdr-pixel-format";
pub const HEADER_TIMESTAMP_MS: &str = "x-hdr-timestamp-ms";

const FRAME_HEADERS: [&str; 6] = [
    HEADER_FRAME_SEQ,
    HEADER_WIDTH,
    HEADER_HEIGHT,
    HEADER_STRIDE,
    HEADER_PIXEL_FORMAT,
    HEADER_TIMESTAMP_MS,
];

type Streams = Arc<RwLock<HashMap<String, PushFrameSender>>>;

#[derive(Debug, Default, Deserialize)]
struct FrameQuery {
    #[serde(rename = "minSeq", default)]
    min_seq: u64,
}

/// Loopback frame server shared by every session using the HTTP fallback
#[derive(Debug)]
pub struct FrameServer {
    addr:     SocketAddr,
    streams:  Streams,
    shutdown: CancellationToken,
    task:     JoinHandle<()>,
}

impl FrameServer {
    /// Binds `127.0.0.1:{port}` (0 picks a free port) and starts serving
    ///
    /// # Errors
    ///
    /// [`crate::error::CaptureError::IoError`] if the listener cannot bind.
    pub async fn start(port: u16) -> CaptureResult<Self> {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;
        let streams: Streams = Arc::default();
        let shutdown = CancellationToken::new();

        let app = router(streams.clone());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!("frame server stopped with error: {e}");
            }
        });

        info!("frame server listening on http://{addr}");
        Ok(Self {
            addr,
            streams,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Exposes a stream and returns its opaque token
    pub fn register(&self, source: PushFrameSender) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.streams.write().insert(token.clone(), source);
        debug!(token = %token, "frame stream registered");
        token
    }

    /// Stops serving a stream. Unknown tokens are ignored.
    pub fn unregister(&self, token: &str) {
        if self.streams.write().remove(token).is_some() {
            debug!(token = %token, "frame stream unregistered");
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn frame_url(&self, token: &str) -> String {
        format!("http://{}/frame/{token}", self.addr)
    }

    /// Stops accepting connections and waits for the server task
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("frame server task failed: {e}");
        }
    }
}

fn router(streams: Streams) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .expose_headers(FRAME_HEADERS.map(HeaderName::from_static));

    Router::new()
        .route("/frame/{token}", get(get_frame))
        .layer(cors)
        .with_state(streams)
}

/// GET /frame/{token}?minSeq=N
async fn get_frame(
    State(streams): State<Streams>,
    Path(token): Path<String>,
    Query(query): Query<FrameQuery>,
) -> Response {
    let Some(source) = streams.read().get(&token).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(frame) = source.latest() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    if frame.seq <= query.min_seq {
        return StatusCode::NO_CONTENT.into_response();
    }

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (HeaderName::from_static(HEADER_FRAME_SEQ), HeaderValue::from(frame.seq)),
            (HeaderName::from_static(HEADER_WIDTH), HeaderValue::from(frame.width)),
            (HeaderName::from_static(HEADER_HEIGHT), HeaderValue::from(frame.height)),
            (HeaderName::from_static(HEADER_STRIDE), HeaderValue::from(frame.stride)),
            (
                HeaderName::from_static(HEADER_PIXEL_FORMAT),
                HeaderValue::from_static(frame.pixel_format.as_str()),
            ),
            (HeaderName::from_static(HEADER_TIMESTAMP_MS), HeaderValue::from(frame.timestamp_ms)),
        ],
        frame.bytes,
    )
        .into_response()
}
