//! Performance counters for the frame pump and preview encoder
//!
//! The pump smooths every latency and throughput sample with an
//! exponentially weighted moving average before it is exposed through
//! diagnostics.
//!
//! ## Key Components
//!
//! - [`Ewma`]: smoothing with `ewma = ewma > 0 ? ewma*(1-α) + sample*α : sample`
//! - [`PumpPerf`]: the set of averages one pump maintains
//! - [`PerfSnapshot`]: serializable view of [`PumpPerf`]
//! - [`time_async`] / [`time_sync`]: duration measurement wrappers
//!
//! ## Usage
//!
//! ```
//! use hdr_capture_bridge::perf::Ewma;
//!
//! let mut read_ms = Ewma::default();
//! read_ms.update(10.0);
//! read_ms.update(20.0);
//! assert!((read_ms.value() - 12.0).abs() < 1e-9);
//! ```

use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::capture::constants::EWMA_ALPHA;

/// Exponentially weighted moving average
///
/// The first sample (or any sample while the average is still zero) seeds
/// the average directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(EWMA_ALPHA)
    }
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { value: 0.0, alpha }
    }

    /// Folds `sample` into the average and returns the new value
    pub fn update(&mut self, sample: f64) -> f64 {
        if !sample.is_finite() {
            return self.value;
        }
        self.value = if self.value > 0.0 {
            self.value * (1.0 - self.alpha) + sample * self.alpha
        } else {
            sample
        };
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Smoothed pump and preview metrics for one session
#[derive(Debug, Clone, Default)]
pub struct PumpPerf {
    pub read_ms:                         Ewma,
    pub copy_ms:                         Ewma,
    pub shared_write_ms:                 Ewma,
    pub bytes_per_frame:                 Ewma,
    pub bytes_per_sec:                   Ewma,
    pub pump_jitter_ms:                  Ewma,
    pub frame_interval_ms:               Ewma,
    pub preview_encode_ms:               Ewma,
    pub preview_dropped_by_backpressure: u64,
    last_frame_at:                       Option<Instant>,
}

impl PumpPerf {
    /// Records the arrival of a frame of `byte_length` bytes
    ///
    /// Updates the inter-frame interval, throughput and jitter (deviation from
    /// `expected_interval_ms`). The first frame only seeds the clock.
    pub fn record_frame(&mut self, now: Instant, byte_length: usize, expected_interval_ms: f64) {
        self.bytes_per_frame.update(byte_length as f64);
        if let Some(previous) = self.last_frame_at {
            let interval_ms = millis(now.saturating_duration_since(previous));
            self.frame_interval_ms.update(interval_ms);
            self.pump_jitter_ms
                .update((interval_ms - expected_interval_ms).abs());
            if interval_ms > 0.0 {
                self.bytes_per_sec
                    .update(byte_length as f64 * 1000.0 / interval_ms);
            }
        }
        self.last_frame_at = Some(now);
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            read_ms_avg:                     self.read_ms.value(),
            copy_ms_avg:                     self.copy_ms.value(),
            sab_write_ms_avg:                self.shared_write_ms.value(),
            bytes_per_frame_avg:             self.bytes_per_frame.value(),
            bytes_per_sec:                   self.bytes_per_sec.value(),
            pump_jitter_ms_avg:              self.pump_jitter_ms.value(),
            frame_interval_ms_avg:           self.frame_interval_ms.value(),
            preview_encode_ms_avg:           self.preview_encode_ms.value(),
            preview_dropped_by_backpressure: self.preview_dropped_by_backpressure,
        }
    }
}

/// Serializable view of [`PumpPerf`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PerfSnapshot {
    pub read_ms_avg:                     f64,
    pub copy_ms_avg:                     f64,
    pub sab_write_ms_avg:                f64,
    pub bytes_per_frame_avg:             f64,
    pub bytes_per_sec:                   f64,
    pub pump_jitter_ms_avg:              f64,
    pub frame_interval_ms_avg:           f64,
    pub preview_encode_ms_avg:           f64,
    pub preview_dropped_by_backpressure: u64,
}

/// Duration as fractional milliseconds
pub fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Measures the duration of an async operation
///
/// ## Example
///
/// ```ignore
/// use hdr_capture_bridge::perf::time_async;
///
/// let (frame, elapsed) = time_async(backend.read_frame(id, timeout)).await;
/// ```
pub async fn time_async<F, T>(operation: F) -> (T, Duration)
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = operation.await;
    (result, start.elapsed())
}

/// Measures the duration of a synchronous closure
pub fn time_sync<T>(operation: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let result = operation();
    (result, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_seeds_with_first_sample() {
        let mut ewma = Ewma::default();
        assert_eq!(ewma.update(30.0), 30.0);
    }

    #[test]
    fn test_ewma_smoothing_factor() {
        let mut ewma = Ewma::default();
        ewma.update(10.0);
        let value = ewma.update(20.0);
        // 10 * 0.8 + 20 * 0.2
        assert!((value - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_ignores_non_finite_samples() {
        let mut ewma = Ewma::default();
        ewma.update(5.0);
        ewma.update(f64::NAN);
        assert_eq!(ewma.value(), 5.0);
    }

    #[test]
    fn test_ewma_reseeds_after_reset() {
        let mut ewma = Ewma::default();
        ewma.update(100.0);
        ewma.reset();
        assert_eq!(ewma.update(4.0), 4.0);
    }

    #[test]
    fn test_record_frame_interval_and_throughput() {
        let mut perf = PumpPerf::default();
        let start = Instant::now();

        perf.record_frame(start, 1000, 16.0);
        assert_eq!(perf.frame_interval_ms.value(), 0.0);
        assert_eq!(perf.bytes_per_frame.value(), 1000.0);

        perf.record_frame(start + Duration::from_millis(20), 1000, 16.0);
        assert!((perf.frame_interval_ms.value() - 20.0).abs() < 1e-6);
        assert!((perf.pump_jitter_ms.value() - 4.0).abs() < 1e-6);
        assert!((perf.bytes_per_sec.value() - 50_000.0).abs() < 1e-3);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut perf = PumpPerf::default();
        perf.read_ms.update(3.0);
        perf.preview_dropped_by_backpressure = 2;

        let value = serde_json::to_value(perf.snapshot()).unwrap();
        assert_eq!(value["readMsAvg"], 3.0);
        assert_eq!(value["sabWriteMsAvg"], 0.0);
        assert_eq!(value["previewDroppedByBackpressure"], 2);
    }

    #[test]
    fn test_time_sync() {
        let (value, duration) = time_sync(|| 7);
        assert_eq!(value, 7);
        assert!(duration <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_time_async() {
        let (value, _duration) = time_async(async { 42 }).await;
        assert_eq!(value, 42);
    }
}
