//! Adaptive lossy preview of the latest frame
//!
//! The preview runs beside the main frame path and must never slow it down.
//! [`PreviewState`] decides which frames are worth encoding (rate limit and
//! frame step) and retunes quality, size and frame step from a smoothed
//! encode time after every encode:
//!
//! | Smoothed encode time | frame step | quality | max box |
//! |---|---|---|---|
//! | > 24 ms | +1 (cap) | −4 (floor 40) | ×0.9 (floor 640×360) |
//! | 12–24 ms | — | — | — |
//! | < 12 ms | −1 (floor 1) | +2 (configured ceiling) | ×1.05 (configured max) |
//!
//! Encode failures disable the preview; the capture path carries on.

use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::STANDARD};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    capture::constants::{
        PREVIEW_DEFAULT_MAX_FRAME_STEP, PREVIEW_DEFAULT_MAX_HEIGHT, PREVIEW_DEFAULT_MAX_WIDTH,
        PREVIEW_DEFAULT_QUALITY, PREVIEW_FAST_ENCODE_MS, PREVIEW_MIN_HEIGHT, PREVIEW_MIN_WIDTH,
        PREVIEW_QUALITY_CEILING, PREVIEW_QUALITY_FLOOR, PREVIEW_SLOW_ENCODE_MS,
    },
    error::CaptureResult,
    model::{Frame, PreviewImage},
    perf::Ewma,
};

pub mod encode;
pub mod image_buffer;

use encode::encode_jpeg;
use image_buffer::FrameImage;

/// Payload of `preview-config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfig {
    pub enabled:        bool,
    /// Starting quality and the ceiling tuning may climb back to
    pub quality:        u8,
    pub max_width:      u32,
    pub max_height:     u32,
    pub max_frame_step: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled:        true,
            quality:        PREVIEW_DEFAULT_QUALITY,
            max_width:      PREVIEW_DEFAULT_MAX_WIDTH,
            max_height:     PREVIEW_DEFAULT_MAX_HEIGHT,
            max_frame_step: PREVIEW_DEFAULT_MAX_FRAME_STEP,
        }
    }
}

/// Direction of the last tuning step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneAction {
    ShedLoad,
    Hold,
    Recover,
}

/// Serializable preview status for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub enabled:                         bool,
    pub quality:                         u8,
    pub max_width:                       u32,
    pub max_height:                      u32,
    pub frame_step:                      u32,
    pub encode_ms_avg:                   f64,
    pub preview_dropped_by_backpressure: u64,
    pub disabled_reason:                 Option<String>,
}

/// Adaptive encode parameters for one session
///
/// Owned by the worker and touched only between pump iterations.
#[derive(Debug, Clone)]
pub struct PreviewState {
    config:                  PreviewConfig,
    enabled:                 bool,
    quality:                 u8,
    max_width:               u32,
    max_height:              u32,
    frame_step:              u32,
    min_interval:            Duration,
    last_encoded_seq:        Option<u64>,
    last_encoded_at:         Option<Instant>,
    encode_ms:               Ewma,
    dropped_by_backpressure: u64,
    disabled_reason:         Option<String>,
}

/// `max(1, round(1000 / max_fps))` milliseconds
pub fn min_interval_ms(max_fps: u32) -> u64 {
    ((1000.0 / f64::from(max_fps.max(1))).round() as u64).max(1)
}

impl PreviewState {
    pub fn new(config: PreviewConfig, max_fps: u32) -> Self {
        let config = sanitize(config);
        Self {
            enabled: config.enabled,
            quality: config.quality,
            max_width: config.max_width,
            max_height: config.max_height,
            frame_step: 1,
            min_interval: Duration::from_millis(min_interval_ms(max_fps)),
            last_encoded_seq: None,
            last_encoded_at: None,
            encode_ms: Ewma::default(),
            dropped_by_backpressure: 0,
            disabled_reason: None,
            config,
        }
    }

    /// Applies a new configuration, resetting the tuned values
    pub fn reconfigure(&mut self, config: PreviewConfig) {
        let config = sanitize(config);
        self.config = config;
        self.enabled = config.enabled;
        self.quality = config.quality;
        self.max_width = config.max_width;
        self.max_height = config.max_height;
        self.frame_step = self.frame_step.clamp(1, config.max_frame_step);
        self.disabled_reason = None;
    }

    /// Whether frame `seq` arriving at `now` should be encoded
    pub fn should_encode(&self, seq: u64, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(last) = self.last_encoded_seq {
            if seq.saturating_sub(last) < u64::from(self.frame_step) {
                return false;
            }
        }
        match self.last_encoded_at {
            Some(at) => now.saturating_duration_since(at) >= self.min_interval,
            None => true,
        }
    }

    /// Records a finished encode of frame `seq` and retunes
    pub fn record_encode(&mut self, seq: u64, now: Instant, encode_ms: f64) -> TuneAction {
        if let Some(last) = self.last_encoded_seq {
            let gap = seq.saturating_sub(last);
            let step = u64::from(self.frame_step);
            if gap > step {
                self.dropped_by_backpressure += gap - step;
            }
        }
        self.last_encoded_seq = Some(seq);
        self.last_encoded_at = Some(now);

        let avg = self.encode_ms.update(encode_ms);
        self.tune(avg)
    }

    fn tune(&mut self, encode_ms_avg: f64) -> TuneAction {
        let min_width = PREVIEW_MIN_WIDTH.min(self.config.max_width);
        let min_height = PREVIEW_MIN_HEIGHT.min(self.config.max_height);

        if encode_ms_avg > PREVIEW_SLOW_ENCODE_MS {
            self.frame_step = (self.frame_step + 1).min(self.config.max_frame_step);
            self.quality = self
                .quality
                .saturating_sub(4)
                .max(PREVIEW_QUALITY_FLOOR);
            self.max_width = scale(self.max_width, 0.9).max(min_width);
            self.max_height = scale(self.max_height, 0.9).max(min_height);
            tracing::trace!(encode_ms_avg, quality = self.quality, step = self.frame_step, "preview shedding load");
            TuneAction::ShedLoad
        } else if encode_ms_avg < PREVIEW_FAST_ENCODE_MS {
            self.frame_step = self.frame_step.saturating_sub(1).max(1);
            self.quality = (self.quality + 2).min(self.config.quality);
            self.max_width = scale(self.max_width, 1.05).min(self.config.max_width);
            self.max_height = scale(self.max_height, 1.05).min(self.config.max_height);
            TuneAction::Recover
        } else {
            TuneAction::Hold
        }
    }

    /// Turns the preview off after a failure
    pub fn disable(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "preview disabled");
        self.enabled = false;
        self.disabled_reason = Some(reason);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn frame_step(&self) -> u32 {
        self.frame_step
    }

    pub fn max_size(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    pub fn encode_ms_avg(&self) -> f64 {
        self.encode_ms.value()
    }

    pub fn dropped_by_backpressure(&self) -> u64 {
        self.dropped_by_backpressure
    }

    pub fn status(&self) -> PreviewStatus {
        PreviewStatus {
            enabled:                         self.enabled,
            quality:                         self.quality,
            max_width:                       self.max_width,
            max_height:                      self.max_height,
            frame_step:                      self.frame_step,
            encode_ms_avg:                   self.encode_ms.value(),
            preview_dropped_by_backpressure: self.dropped_by_backpressure,
            disabled_reason:                 self.disabled_reason.clone(),
        }
    }
}

fn sanitize(config: PreviewConfig) -> PreviewConfig {
    PreviewConfig {
        quality: config.quality.clamp(PREVIEW_QUALITY_FLOOR, PREVIEW_QUALITY_CEILING),
        max_width: config.max_width.max(1),
        max_height: config.max_height.max(1),
        max_frame_step: config.max_frame_step.max(1),
        ..config
    }
}

fn scale(value: u32, factor: f64) -> u32 {
    (f64::from(value) * factor).round() as u32
}

/// Downscales and JPEG-encodes one frame
///
/// Runs on a blocking thread; the caller measures its duration.
pub fn render_preview(
    frame: &Frame,
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> CaptureResult<PreviewImage> {
    let image = FrameImage::from_raw(
        &frame.bytes,
        frame.width,
        frame.height,
        frame.stride,
        frame.pixel_format,
    )?
    .fit_within(max_width, max_height);
    let (width, height) = image.dimensions();
    let jpeg = encode_jpeg(&image, quality)?;

    Ok(PreviewImage {
        seq: frame.seq,
        width,
        height,
        quality,
        mime_type: "image/jpeg".to_string(),
        data: STANDARD.encode(jpeg),
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::model::PixelFormat;

    fn state() -> PreviewState {
        PreviewState::new(PreviewConfig::default(), 60)
    }

    #[test]
    fn test_min_interval() {
        assert_eq!(min_interval_ms(60), 17);
        assert_eq!(min_interval_ms(30), 33);
        assert_eq!(min_interval_ms(0), 1000);
        assert_eq!(min_interval_ms(5000), 1);
    }

    #[test]
    fn test_rate_limit_and_frame_step_gate() {
        let mut preview = state();
        let t0 = Instant::now();

        assert!(preview.should_encode(1, t0));
        preview.record_encode(1, t0, 18.0);

        // too soon
        assert!(!preview.should_encode(2, t0 + Duration::from_millis(5)));
        // interval elapsed
        assert!(preview.should_encode(2, t0 + Duration::from_millis(17)));
        // same seq never re-encodes
        assert!(!preview.should_encode(1, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_slow_encodes_shed_load() {
        let mut preview = state();
        let t0 = Instant::now();

        let action = preview.record_encode(1, t0, 40.0);
        assert_eq!(action, TuneAction::ShedLoad);
        assert_eq!(preview.frame_step(), 2);
        assert_eq!(preview.quality(), PREVIEW_DEFAULT_QUALITY - 4);
        assert_eq!(preview.max_size(), (1152, 648));
    }

    #[test]
    fn test_shedding_respects_floors_and_cap() {
        let mut preview = state();
        let t0 = Instant::now();

        for seq in 1..=100u64 {
            preview.record_encode(seq * 10, t0, 100.0);
        }
        assert_eq!(preview.frame_step(), PREVIEW_DEFAULT_MAX_FRAME_STEP);
        assert_eq!(preview.quality(), PREVIEW_QUALITY_FLOOR);
        assert_eq!(preview.max_size(), (PREVIEW_MIN_WIDTH, PREVIEW_MIN_HEIGHT));
    }

    #[test]
    fn test_fast_encodes_recover_to_configured_ceiling() {
        let mut preview = state();
        let t0 = Instant::now();
        for seq in 1..=5u64 {
            preview.record_encode(seq, t0, 100.0);
        }
        preview.encode_ms.reset();

        for seq in 6..=200u64 {
            preview.record_encode(seq, t0, 1.0);
        }
        assert_eq!(preview.frame_step(), 1);
        assert_eq!(preview.quality(), PREVIEW_DEFAULT_QUALITY);
        assert_eq!(preview.max_size(), (PREVIEW_DEFAULT_MAX_WIDTH, PREVIEW_DEFAULT_MAX_HEIGHT));
    }

    #[test]
    fn test_hysteresis_band_holds_steady() {
        let mut preview = state();
        let t0 = Instant::now();
        let before = (preview.quality(), preview.frame_step(), preview.max_size());

        for (i, sample) in [13.0, 23.0].iter().cycle().take(40).enumerate() {
            let action = preview.record_encode(i as u64 + 1, t0, *sample);
            assert_eq!(action, TuneAction::Hold);
        }
        assert_eq!((preview.quality(), preview.frame_step(), preview.max_size()), before);
    }

    #[test]
    fn test_backpressure_counts_seq_gap_beyond_step() {
        let mut preview = state();
        let t0 = Instant::now();

        preview.record_encode(1, t0, 18.0);
        preview.record_encode(2, t0, 18.0);
        assert_eq!(preview.dropped_by_backpressure(), 0);

        preview.record_encode(6, t0, 18.0);
        assert_eq!(preview.dropped_by_backpressure(), 3);
    }

    #[test]
    fn test_disable_blocks_encoding() {
        let mut preview = state();
        preview.disable("PREVIEW_ENCODE_FAILED");

        assert!(!preview.should_encode(1, Instant::now()));
        assert_eq!(preview.status().disabled_reason.as_deref(), Some("PREVIEW_ENCODE_FAILED"));

        preview.reconfigure(PreviewConfig::default());
        assert!(preview.is_enabled());
    }

    #[test]
    fn test_config_quality_is_clamped() {
        let preview = PreviewState::new(
            PreviewConfig {
                quality: 100,
                ..PreviewConfig::default()
            },
            60,
        );
        assert_eq!(preview.quality(), PREVIEW_QUALITY_CEILING);
    }

    #[test]
    fn test_render_preview_fits_box() {
        let width = 64u32;
        let height = 32u32;
        let frame = Frame {
            seq:          9,
            width,
            height,
            stride:       width * 4,
            pixel_format: PixelFormat::Bgra8,
            timestamp_ms: 0,
            bytes:        Bytes::from(vec![200u8; (width * 4 * height) as usize]),
        };

        let preview = render_preview(&frame, 32, 32, 70).unwrap();
        assert_eq!((preview.width, preview.height), (32, 16));
        assert_eq!(preview.seq, 9);
        assert_eq!(preview.mime_type, "image/jpeg");
        let jpeg = STANDARD.decode(&preview.data).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
