//! Centralized timeout, threshold and limit constants.
//!
//! # Runtime Configuration
//!
//! Timeouts, stall thresholds and route enable flags can be overridden at
//! runtime via environment variables:
//!
//! | Environment Variable | Default | Description |
//! |---------------------|---------|-------------|
//! | `HDR_BRIDGE_CONTROL_TIMEOUT_MS` | 4000 | Coordinator→worker control request budget |
//! | `HDR_BRIDGE_FRAME_TIMEOUT_MS` | 1500 | Coordinator→worker frame request budget |
//! | `HDR_BRIDGE_BIND_TIMEOUT_MS` | 2000 | Shared-buffer bind budget |
//! | `HDR_BRIDGE_STALL_IDLE_MS` | 2000 | Idle time before a hard fallback |
//! | `HDR_BRIDGE_READ_FAILURE_LIMIT` | 8 | Consecutive read failures before a hard fallback |
//! | `HDR_BRIDGE_WGC_ENABLED` | true | Enable the wgc tier |
//! | `HDR_BRIDGE_LEGACY_ENABLED` | true | Enable the legacy tier |
//!
//! Everything else here is fixed at compile time.

use crate::model::RouteAvailability;

/// Budget for coordinator→worker control requests (start, stop, bind, config).
pub const CONTROL_TIMEOUT_MS: u64 = 4000;

/// Budget for coordinator→worker frame requests (`frame-read`, previews).
pub const FRAME_TIMEOUT_MS: u64 = 1500;

/// Budget for the worker to acknowledge a shared-buffer bind.
pub const BIND_TIMEOUT_MS: u64 = 2000;

/// A running session with no new frame for this long triggers a hard fallback.
pub const STALL_IDLE_MS: u64 = 2000;

/// Consecutive failed reads that trigger a hard fallback.
pub const READ_FAILURE_LIMIT: u32 = 8;

/// Extra delay added per consecutive empty or failed read.
pub const BACKOFF_STEP_MS: u64 = 2;

/// Upper bound on the no-frame backoff. Tunable, not a protocol value.
pub const BACKOFF_CAP_MS: u64 = 48;

/// Smoothing factor for every EWMA counter.
pub const EWMA_ALPHA: f64 = 0.2;

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 120;

/// Slack added to the pump interval to form the backend read timeout.
pub const READ_TIMEOUT_SLACK_MS: u64 = 6;

/// Ceiling for the backend read timeout.
pub const READ_TIMEOUT_MAX_MS: u64 = 120;

/// Smallest shared frame region ever allocated.
pub const SHARED_REGION_MIN_BYTES: usize = 1024 * 1024;

/// Largest capture the native backends accept (4K UHD).
pub const MAX_CAPTURE_PIXELS: u64 = 3840 * 2160;

/// Largest pixel payload (`width * height * 4`) any transport carries.
/// Row padding does not count against it.
pub const MAX_FRAME_BYTES: usize = 3840 * 2160 * 4;

/// Largest staging or shared region, leaving room for a stride up to twice
/// the packed row.
pub const MAX_REGION_BYTES: usize = MAX_FRAME_BYTES * 2;

/// Output pixel budget when the caller does not set one.
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 640 * 360;

/// Entries kept in the fallback trace ring.
pub const TRACE_CAPACITY: usize = 120;

pub const PREVIEW_QUALITY_FLOOR: u8 = 40;
pub const PREVIEW_QUALITY_CEILING: u8 = 95;
pub const PREVIEW_DEFAULT_QUALITY: u8 = 80;

/// Smoothed encode time above which the preview sheds load.
pub const PREVIEW_SLOW_ENCODE_MS: f64 = 24.0;

/// Smoothed encode time below which the preview recovers quality.
pub const PREVIEW_FAST_ENCODE_MS: f64 = 12.0;

pub const PREVIEW_MIN_WIDTH: u32 = 640;
pub const PREVIEW_MIN_HEIGHT: u32 = 360;
pub const PREVIEW_DEFAULT_MAX_WIDTH: u32 = 1280;
pub const PREVIEW_DEFAULT_MAX_HEIGHT: u32 = 720;
pub const PREVIEW_DEFAULT_MAX_FRAME_STEP: u32 = 4;

// =============================================================================
// Environment Variable Overrides
// =============================================================================

/// Helper to get a numeric value from an environment variable or fall back to default.
fn get_number_from_env<T: std::str::FromStr>(env_var: &str, default: T) -> T {
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Helper to get a boolean flag from an environment variable.
///
/// Accepts `1/0`, `true/false`, `on/off`, `yes/no` (case-insensitive).
fn get_flag_from_env(env_var: &str, default: bool) -> bool {
    match std::env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Override with: `HDR_BRIDGE_CONTROL_TIMEOUT_MS`
pub fn control_timeout_ms() -> u64 {
    get_number_from_env("HDR_BRIDGE_CONTROL_TIMEOUT_MS", CONTROL_TIMEOUT_MS)
}

/// Override with: `HDR_BRIDGE_FRAME_TIMEOUT_MS`
pub fn frame_timeout_ms() -> u64 {
    get_number_from_env("HDR_BRIDGE_FRAME_TIMEOUT_MS", FRAME_TIMEOUT_MS)
}

/// Override with: `HDR_BRIDGE_BIND_TIMEOUT_MS`
pub fn bind_timeout_ms() -> u64 {
    get_number_from_env("HDR_BRIDGE_BIND_TIMEOUT_MS", BIND_TIMEOUT_MS)
}

/// Override with: `HDR_BRIDGE_STALL_IDLE_MS`
///
/// # Example
///
/// ```bash
/// # Tolerate longer gaps on a display that idles its compositor
/// export HDR_BRIDGE_STALL_IDLE_MS=5000
/// ```
pub fn stall_idle_ms() -> u64 {
    get_number_from_env("HDR_BRIDGE_STALL_IDLE_MS", STALL_IDLE_MS)
}

/// Override with: `HDR_BRIDGE_READ_FAILURE_LIMIT`
pub fn read_failure_limit() -> u32 {
    get_number_from_env("HDR_BRIDGE_READ_FAILURE_LIMIT", READ_FAILURE_LIMIT).max(1)
}

/// Route enable flags from `HDR_BRIDGE_WGC_ENABLED` / `HDR_BRIDGE_LEGACY_ENABLED`
pub fn route_availability() -> RouteAvailability {
    RouteAvailability {
        wgc_enabled:    get_flag_from_env("HDR_BRIDGE_WGC_ENABLED", true),
        legacy_enabled: get_flag_from_env("HDR_BRIDGE_LEGACY_ENABLED", true),
    }
}

/// `floor(1000 / clamp(max_fps, 1, 120))`
pub fn pump_interval_ms(max_fps: u32) -> u64 {
    1000 / u64::from(max_fps.clamp(MIN_FPS, MAX_FPS))
}

/// `clamp(pump_interval + 6, 1, 120)`
pub fn read_timeout_ms(pump_interval_ms: u64) -> u64 {
    (pump_interval_ms + READ_TIMEOUT_SLACK_MS).clamp(1, READ_TIMEOUT_MAX_MS)
}

/// Linear backoff after `no_frame_streak` consecutive empty or failed reads
///
/// # Examples
///
/// ```
/// use hdr_capture_bridge::capture::constants::backoff_ms;
///
/// assert_eq!(backoff_ms(0), 0);
/// assert_eq!(backoff_ms(3), 6);
/// assert_eq!(backoff_ms(1000), 48);
/// ```
pub fn backoff_ms(no_frame_streak: u32) -> u64 {
    (u64::from(no_frame_streak) * BACKOFF_STEP_MS).min(BACKOFF_CAP_MS)
}

/// Packed pixel payload of a frame, the quantity [`MAX_FRAME_BYTES`] bounds
pub fn payload_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Runtime settings gathered once and handed to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub control_timeout_ms: u64,
    pub frame_timeout_ms:   u64,
    pub bind_timeout_ms:    u64,
    pub stall_idle_ms:      u64,
    pub read_failure_limit: u32,
    pub availability:       RouteAvailability,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: CONTROL_TIMEOUT_MS,
            frame_timeout_ms:   FRAME_TIMEOUT_MS,
            bind_timeout_ms:    BIND_TIMEOUT_MS,
            stall_idle_ms:      STALL_IDLE_MS,
            read_failure_limit: READ_FAILURE_LIMIT,
            availability:       RouteAvailability::default(),
        }
    }
}

impl BridgeConfig {
    /// Reads every override from the environment
    pub fn from_env() -> Self {
        Self {
            control_timeout_ms: control_timeout_ms(),
            frame_timeout_ms:   frame_timeout_ms(),
            bind_timeout_ms:    bind_timeout_ms(),
            stall_idle_ms:      stall_idle_ms(),
            read_failure_limit: read_failure_limit(),
            availability:       route_availability(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::assertions_on_constants)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_sanity() {
        assert!(FRAME_TIMEOUT_MS < CONTROL_TIMEOUT_MS);
        assert!(READ_TIMEOUT_MAX_MS < FRAME_TIMEOUT_MS);
        assert!(SHARED_REGION_MIN_BYTES < MAX_FRAME_BYTES);
        assert!(PREVIEW_FAST_ENCODE_MS < PREVIEW_SLOW_ENCODE_MS);
        assert!(PREVIEW_QUALITY_FLOOR <= PREVIEW_DEFAULT_QUALITY);
        assert!(PREVIEW_DEFAULT_QUALITY <= PREVIEW_QUALITY_CEILING);
    }

    #[test]
    fn test_frame_limit_matches_capture_limit() {
        assert_eq!(MAX_FRAME_BYTES as u64, MAX_CAPTURE_PIXELS * 4);
        assert_eq!(payload_bytes(3840, 2160), MAX_FRAME_BYTES);
    }

    #[test]
    fn test_region_limit_fits_padded_4k() {
        let padded_stride = 3840 * 4 + 256;
        assert!(padded_stride * 2160 <= MAX_REGION_BYTES);
    }

    #[test]
    fn test_pump_interval() {
        assert_eq!(pump_interval_ms(60), 16);
        assert_eq!(pump_interval_ms(30), 33);
        assert_eq!(pump_interval_ms(0), 1000);
        assert_eq!(pump_interval_ms(500), 8);
    }

    #[test]
    fn test_read_timeout() {
        assert_eq!(read_timeout_ms(16), 22);
        assert_eq!(read_timeout_ms(1000), READ_TIMEOUT_MAX_MS);
        assert_eq!(read_timeout_ms(0), 6);
    }

    #[test]
    fn test_backoff_bound() {
        for streak in 0..200u32 {
            let delay = backoff_ms(streak);
            assert_eq!(delay, (u64::from(streak) * 2).min(48));
            assert!(delay <= BACKOFF_CAP_MS);
        }
        assert_eq!(backoff_ms(u32::MAX), BACKOFF_CAP_MS);
    }

    #[test]
    fn test_env_override_defaults() {
        temp_env::with_vars_unset(
            [
                "HDR_BRIDGE_CONTROL_TIMEOUT_MS",
                "HDR_BRIDGE_FRAME_TIMEOUT_MS",
                "HDR_BRIDGE_BIND_TIMEOUT_MS",
                "HDR_BRIDGE_STALL_IDLE_MS",
                "HDR_BRIDGE_READ_FAILURE_LIMIT",
                "HDR_BRIDGE_WGC_ENABLED",
                "HDR_BRIDGE_LEGACY_ENABLED",
            ],
            || {
                assert_eq!(BridgeConfig::from_env(), BridgeConfig::default());
            },
        );
    }

    #[test]
    fn test_env_override_with_value() {
        temp_env::with_var("HDR_BRIDGE_CONTROL_TIMEOUT_MS", Some("8000"), || {
            assert_eq!(control_timeout_ms(), 8000);
        });

        temp_env::with_var("HDR_BRIDGE_STALL_IDLE_MS", Some("5000"), || {
            assert_eq!(BridgeConfig::from_env().stall_idle_ms, 5000);
        });

        temp_env::with_var("HDR_BRIDGE_READ_FAILURE_LIMIT", Some("3"), || {
            assert_eq!(read_failure_limit(), 3);
        });
    }

    #[test]
    fn test_env_override_invalid_value() {
        temp_env::with_var("HDR_BRIDGE_FRAME_TIMEOUT_MS", Some("fast"), || {
            assert_eq!(frame_timeout_ms(), FRAME_TIMEOUT_MS);
        });

        temp_env::with_var("HDR_BRIDGE_BIND_TIMEOUT_MS", Some("-1"), || {
            assert_eq!(bind_timeout_ms(), BIND_TIMEOUT_MS);
        });

        temp_env::with_var("HDR_BRIDGE_READ_FAILURE_LIMIT", Some("0"), || {
            assert_eq!(read_failure_limit(), 1);
        });
    }

    #[test]
    fn test_route_flags_from_env() {
        temp_env::with_vars(
            [
                ("HDR_BRIDGE_WGC_ENABLED", Some("0")),
                ("HDR_BRIDGE_LEGACY_ENABLED", Some("TRUE")),
            ],
            || {
                let availability = route_availability();
                assert!(!availability.wgc_enabled);
                assert!(availability.legacy_enabled);
            },
        );

        temp_env::with_var("HDR_BRIDGE_WGC_ENABLED", Some("maybe"), || {
            assert!(route_availability().wgc_enabled);
        });
    }
}
