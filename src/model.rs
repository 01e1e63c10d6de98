//! Data models shared by the selector, worker, transports and coordinator
//!
//! Wire-facing types serialize in camelCase to match the worker control
//! protocol; enums that name routes and transports use their kebab-case
//! labels (`wgc-v1`, `shared-buffer`, ...).

use std::fmt;

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::capture::constants::{MAX_FPS, MIN_FPS};

/// Pixel layout of a captured frame
///
/// The numeric codes are what the shared control block stores in its
/// `PIXEL_FORMAT` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PixelFormat {
    #[serde(rename = "RGBA8")]
    Rgba8,
    #[serde(rename = "BGRA8")]
    Bgra8,
}

impl PixelFormat {
    /// Control-block code (`1 = RGBA8`, `2 = BGRA8`)
    pub fn code(self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 1,
            PixelFormat::Bgra8 => 2,
        }
    }

    /// Parses a control-block code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Rgba8),
            2 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "RGBA8",
            PixelFormat::Bgra8 => "BGRA8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route the caller asks the selector to try first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoutePreference {
    #[default]
    Auto,
    Wgc,
    Legacy,
}

impl RoutePreference {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutePreference::Auto => "auto",
            RoutePreference::Wgc => "wgc",
            RoutePreference::Legacy => "legacy",
        }
    }
}

/// Whether native capture is attempted, and whether falling back is allowed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MappingMode {
    /// Native when HDR is active, builtin desktop otherwise
    #[default]
    Auto,
    /// Never use native capture
    Off,
    /// Native or nothing; unavailability blocks the session
    ForceNative,
}

impl MappingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingMode::Auto => "auto",
            MappingMode::Off => "off",
            MappingMode::ForceNative => "force-native",
        }
    }
}

/// Backend tier a session is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RuntimeRoute {
    #[serde(rename = "wgc-v1")]
    WgcV1,
    #[serde(rename = "native-legacy")]
    NativeLegacy,
    #[serde(rename = "builtin-desktop")]
    BuiltinDesktop,
}

impl RuntimeRoute {
    /// Position in the tier order, used for diagnostics only
    ///
    /// # Examples
    ///
    /// ```
    /// use hdr_capture_bridge::model::RuntimeRoute;
    ///
    /// assert!(RuntimeRoute::WgcV1.fallback_level() < RuntimeRoute::NativeLegacy.fallback_level());
    /// assert_eq!(RuntimeRoute::BuiltinDesktop.fallback_level(), 3);
    /// ```
    pub fn fallback_level(self) -> u8 {
        match self {
            RuntimeRoute::WgcV1 => 1,
            RuntimeRoute::NativeLegacy => 2,
            RuntimeRoute::BuiltinDesktop => 3,
        }
    }

    pub fn is_native(self) -> bool {
        !matches!(self, RuntimeRoute::BuiltinDesktop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeRoute::WgcV1 => "wgc-v1",
            RuntimeRoute::NativeLegacy => "native-legacy",
            RuntimeRoute::BuiltinDesktop => "builtin-desktop",
        }
    }
}

impl fmt::Display for RuntimeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How frames reach the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Shared region published through the atomic control block
    SharedBuffer,
    /// In-process single-slot handoff
    PushBuffer,
    /// Localhost `GET /frame/{token}` pull endpoint
    HttpFallback,
    /// Backend-compressed preview stream only (builtin desktop tier)
    NativePreviewStream,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::SharedBuffer => "shared-buffer",
            TransportMode::PushBuffer => "push-buffer",
            TransportMode::HttpFallback => "http-fallback",
            TransportMode::NativePreviewStream => "native-preview-stream",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HDR to SDR tone-mapping parameters handed through to the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ToneMapConfig {
    /// Highlight rolloff, `0.0..=1.0`
    pub rolloff:    f32,
    /// Saturation multiplier, `0.0..=2.0`
    pub saturation: f32,
}

impl Default for ToneMapConfig {
    fn default() -> Self {
        Self {
            rolloff:    0.0,
            saturation: 1.0,
        }
    }
}

impl ToneMapConfig {
    /// Returns a copy with both fields clamped to their valid ranges
    ///
    /// Non-finite values fall back to the defaults.
    pub fn clamped(self) -> Self {
        let defaults = Self::default();
        let rolloff = if self.rolloff.is_finite() {
            self.rolloff.clamp(0.0, 1.0)
        } else {
            defaults.rolloff
        };
        let saturation = if self.saturation.is_finite() {
            self.saturation.clamp(0.0, 2.0)
        } else {
            defaults.saturation
        };
        Self {
            rolloff,
            saturation,
        }
    }
}

/// Display rectangle in desktop coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DisplayBounds {
    pub x:      i32,
    pub y:      i32,
    pub width:  u32,
    pub height: u32,
}

/// Hints about the target display, forwarded to the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisplayHint {
    pub bounds:        Option<DisplayBounds>,
    pub scale_factor:  f64,
    pub is_hdr_likely: bool,
}

/// Enable flags for each native tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteAvailability {
    pub wgc_enabled:    bool,
    pub legacy_enabled: bool,
}

impl Default for RouteAvailability {
    fn default() -> Self {
        Self {
            wgc_enabled:    true,
            legacy_enabled: true,
        }
    }
}

/// Payload of `capture-start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub source_id:         String,
    #[serde(default)]
    pub display_id:        Option<u64>,
    pub max_fps:           u32,
    #[serde(default)]
    pub tone_map:          ToneMapConfig,
    #[serde(default)]
    pub route_preference:  RoutePreference,
    #[serde(default)]
    pub display_hint:      Option<DisplayHint>,
    #[serde(default)]
    pub max_output_pixels: Option<u64>,
    #[serde(default)]
    pub availability:      RouteAvailability,
    /// Continue `frameSeq` from the previous session on this worker
    #[serde(default)]
    pub resume_sequence:   bool,
}

impl StartRequest {
    /// Creates a request for `source_id` at `max_fps` with default options
    ///
    /// # Examples
    ///
    /// ```
    /// use hdr_capture_bridge::model::{RoutePreference, StartRequest};
    ///
    /// let request = StartRequest::new("screen:0", 60).with_route(RoutePreference::Legacy);
    /// assert_eq!(request.route_preference, RoutePreference::Legacy);
    /// assert_eq!(request.clamped_fps(), 60);
    /// ```
    pub fn new(source_id: impl Into<String>, max_fps: u32) -> Self {
        Self {
            source_id: source_id.into(),
            display_id: None,
            max_fps,
            tone_map: ToneMapConfig::default(),
            route_preference: RoutePreference::Auto,
            display_hint: None,
            max_output_pixels: None,
            availability: RouteAvailability::default(),
            resume_sequence: false,
        }
    }

    pub fn with_display(mut self, display_id: u64) -> Self {
        self.display_id = Some(display_id);
        self
    }

    pub fn with_route(mut self, route: RoutePreference) -> Self {
        self.route_preference = route;
        self
    }

    pub fn with_availability(mut self, availability: RouteAvailability) -> Self {
        self.availability = availability;
        self
    }

    /// `max_fps` clamped to the supported range
    pub fn clamped_fps(&self) -> u32 {
        self.max_fps.clamp(MIN_FPS, MAX_FPS)
    }
}

/// Result of `probe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub supported:  bool,
    pub hdr_active: bool,
    pub reason:     String,
}

impl ProbeResult {
    pub fn hdr_active() -> Self {
        Self {
            supported:  true,
            hdr_active: true,
            reason:     "HDR_ACTIVE".to_string(),
        }
    }

    pub fn sdr() -> Self {
        Self {
            supported:  true,
            hdr_active: false,
            reason:     "SDR_OR_UNKNOWN".to_string(),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported:  false,
            hdr_active: false,
            reason:     "NOT_SUPPORTED".to_string(),
        }
    }
}

/// Native session created by `start_capture`
///
/// `stride >= width * 4` and `pixel_format` is fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSessionInfo {
    pub native_session_id: u64,
    pub width:             u32,
    pub height:            u32,
    pub stride:            u32,
    pub pixel_format:      PixelFormat,
}

/// One backend read; empty `bytes` means the read completed without a frame
#[derive(Debug, Clone, Default)]
pub struct RawFrame {
    pub bytes:                Vec<u8>,
    pub width:                u32,
    pub height:               u32,
    pub stride:               u32,
    pub pixel_format:         Option<PixelFormat>,
    pub timestamp_ms:         u64,
    /// Backend asks the coordinator to move to a lower tier
    pub fallback_recommended: bool,
}

impl RawFrame {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Backend-encoded preview image (`readCompressedFrame`)
#[derive(Debug, Clone)]
pub struct CompressedFrame {
    pub bytes:        Vec<u8>,
    pub mime_type:    String,
    pub width:        u32,
    pub height:       u32,
    pub timestamp_ms: u64,
}

/// Metadata of the latest frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub width:        u32,
    pub height:       u32,
    pub stride:       u32,
    pub pixel_format: PixelFormat,
    pub byte_length:  usize,
    pub timestamp_ms: u64,
}

/// A delivered frame
///
/// Immutable once produced. `bytes.len() == stride * height`, which may
/// exceed `width * 4 * height` when rows are padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq:          u64,
    pub width:        u32,
    pub height:       u32,
    pub stride:       u32,
    pub pixel_format: PixelFormat,
    pub timestamp_ms: u64,
    pub bytes:        Bytes,
}

impl Frame {
    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            width:        self.width,
            height:       self.height,
            stride:       self.stride,
            pixel_format: self.pixel_format,
            byte_length:  self.bytes.len(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Lossy preview image, base64 encoded for JSON responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviewImage {
    pub seq:       u64,
    pub width:     u32,
    pub height:    u32,
    pub quality:   u8,
    pub mime_type: String,
    pub data:      String,
}
