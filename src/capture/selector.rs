//! Backend tier selection and the native/fallback mapping decision
//!
//! [`select_backend`] walks an ordered try-list and returns the first backend
//! that can both start and read. It never scores candidates and never talks
//! to the capture API; the only side effect is lazy loading through the
//! [`BackendRegistry`]. When nothing qualifies, the result is the builtin
//! desktop tier with every skip reason joined by `|`.
//!
//! [`resolve_mapping_decision`] then decides, from probe and start results,
//! whether the session runs native, falls back to the builtin path, or is
//! blocked because the caller forced native capture.

use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackendKind, BackendRegistry, CaptureBackend};
use crate::model::{MappingMode, RouteAvailability, RoutePreference, RuntimeRoute};

/// Parses a route preference, case-insensitively; unknown values mean `auto`
///
/// # Examples
///
/// ```
/// use hdr_capture_bridge::{capture::selector::normalize_route_preference, model::RoutePreference};
///
/// assert_eq!(normalize_route_preference(" Legacy "), RoutePreference::Legacy);
/// assert_eq!(normalize_route_preference("dxgi"), RoutePreference::Auto);
/// ```
pub fn normalize_route_preference(value: &str) -> RoutePreference {
    match value.trim().to_ascii_lowercase().as_str() {
        "wgc" => RoutePreference::Wgc,
        "legacy" => RoutePreference::Legacy,
        _ => RoutePreference::Auto,
    }
}

/// Parses a mapping mode, case-insensitively; unknown values mean `auto`
pub fn normalize_mapping_mode(value: &str) -> MappingMode {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => MappingMode::Off,
        "force-native" => MappingMode::ForceNative,
        _ => MappingMode::Auto,
    }
}

/// Candidates in the order they are tried
pub fn try_order(preference: RoutePreference) -> [BackendKind; 2] {
    match preference {
        RoutePreference::Legacy => [BackendKind::Legacy, BackendKind::Wgc],
        RoutePreference::Auto | RoutePreference::Wgc => [BackendKind::Wgc, BackendKind::Legacy],
    }
}

/// Outcome of [`select_backend`]
#[derive(Clone)]
pub enum Selection {
    /// A native backend qualified
    Native {
        kind:          BackendKind,
        backend:       Arc<dyn CaptureBackend>,
        backend_label: String,
        /// Reasons recorded for candidates tried before this one
        skipped:       Vec<String>,
    },
    /// No native backend qualified
    Builtin {
        /// Skip reasons joined by `|`, never empty
        reason: String,
    },
}

impl Selection {
    pub fn route(&self) -> RuntimeRoute {
        match self {
            Selection::Native { kind, .. } => kind.route(),
            Selection::Builtin { .. } => RuntimeRoute::BuiltinDesktop,
        }
    }

    pub fn fallback_level(&self) -> u8 {
        self.route().fallback_level()
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Selection::Native { .. })
    }

    /// Serializable view without the backend handle
    pub fn summary(&self) -> SelectionSummary {
        match self {
            Selection::Native {
                kind,
                backend_label,
                skipped,
                ..
            } => SelectionSummary {
                route:          kind.route(),
                fallback_level: kind.route().fallback_level(),
                backend_label:  backend_label.clone(),
                reason:         (!skipped.is_empty()).then(|| skipped.join("|")),
            },
            Selection::Builtin { reason } => SelectionSummary {
                route:          RuntimeRoute::BuiltinDesktop,
                fallback_level: RuntimeRoute::BuiltinDesktop.fallback_level(),
                backend_label:  String::new(),
                reason:         Some(reason.clone()),
            },
        }
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Native {
                kind,
                backend_label,
                skipped,
                ..
            } => f
                .debug_struct("Native")
                .field("kind", kind)
                .field("backend_label", backend_label)
                .field("skipped", skipped)
                .finish(),
            Selection::Builtin { reason } => {
                f.debug_struct("Builtin").field("reason", reason).finish()
            }
        }
    }
}

/// JSON form of a [`Selection`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSummary {
    pub route:          RuntimeRoute,
    pub fallback_level: u8,
    pub backend_label:  String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason:         Option<String>,
}

/// Chooses the first usable backend for `preference`
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use hdr_capture_bridge::{
///     capture::{BackendKind, BackendRegistry, StaticBackendLoader, SyntheticBackend, select_backend},
///     model::{RouteAvailability, RoutePreference, RuntimeRoute},
/// };
///
/// let loader = StaticBackendLoader::new()
///     .with_backend(BackendKind::Wgc, Arc::new(SyntheticBackend::new("wgc")))
///     .with_backend(BackendKind::Legacy, Arc::new(SyntheticBackend::new("legacy")));
/// let registry = BackendRegistry::new(loader);
///
/// let selection = select_backend(&registry, RoutePreference::Legacy, RouteAvailability::default());
/// assert_eq!(selection.route(), RuntimeRoute::NativeLegacy);
/// ```
pub fn select_backend(
    registry: &BackendRegistry,
    preference: RoutePreference,
    availability: RouteAvailability,
) -> Selection {
    let mut reasons: Vec<String> = Vec::new();

    for kind in try_order(preference) {
        let enabled = match kind {
            BackendKind::Wgc => availability.wgc_enabled,
            BackendKind::Legacy => availability.legacy_enabled,
        };
        if !enabled {
            reasons.push(kind.disabled_reason().to_string());
            continue;
        }

        match registry.resolve(kind) {
            Ok(backend) if backend.capabilities().meets_minimum() => {
                let backend_label = if backend.label().is_empty() {
                    kind.default_label().to_string()
                } else {
                    backend.label().to_string()
                };
                tracing::debug!(%kind, %backend_label, skipped = ?reasons, "backend selected");
                return Selection::Native {
                    kind,
                    backend,
                    backend_label,
                    skipped: reasons,
                };
            }
            Ok(_) => reasons.push(kind.unavailable_reason().to_string()),
            Err(error) => {
                let code = if error.code.is_empty() {
                    kind.unavailable_reason().to_string()
                } else {
                    error.code
                };
                reasons.push(code);
            }
        }
    }

    let reason = if reasons.is_empty() {
        "NATIVE_UNAVAILABLE".to_string()
    } else {
        reasons.join("|")
    };
    tracing::info!(%reason, "no native backend available, using builtin desktop capture");
    Selection::Builtin { reason }
}

/// Where a session ends up after probing and starting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MappingRoute {
    Native,
    Fallback,
    Blocked,
}

/// Result of [`resolve_mapping_decision`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MappingDecision {
    pub route:  MappingRoute,
    pub reason: String,
}

impl MappingDecision {
    fn new(route: MappingRoute, reason: impl Into<String>) -> Self {
        Self {
            route,
            reason: reason.into(),
        }
    }
}

/// Facts gathered while trying to go native
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingInput {
    pub mode:                 MappingMode,
    pub native_route_enabled: bool,
    pub native_route_reason:  Option<String>,
    pub probe_supported:      bool,
    pub probe_reason:         Option<String>,
    pub hdr_active:           bool,
    /// `None` before the start attempt, then the start outcome
    pub native_start:         Option<Result<(), String>>,
}

/// Decides between native capture, the builtin fallback, or blocking
///
/// Rules, first match wins:
///
/// 1. mode `off` → fallback `MODE_OFF`
/// 2. no native route → blocked under `force-native`, else fallback
///    (selector reason or `NATIVE_ROUTE_DISABLED`)
/// 3. probe unsupported → blocked/fallback with the probe reason
///    (default `NATIVE_UNAVAILABLE`)
/// 4. mode `auto` with HDR inactive → fallback (probe reason or
///    `HDR_INACTIVE`)
/// 5. start not attempted yet → native `NATIVE_READY`
/// 6. start ok → native `NATIVE_OK`
/// 7. start failed → blocked/fallback with the start reason (default
///    `START_FAILED`)
///
/// # Examples
///
/// ```
/// use hdr_capture_bridge::{
///     capture::selector::{MappingInput, MappingRoute, resolve_mapping_decision},
///     model::MappingMode,
/// };
///
/// let decision = resolve_mapping_decision(&MappingInput {
///     mode: MappingMode::ForceNative,
///     native_route_enabled: false,
///     native_route_reason: Some("WGC_ROUTE_DISABLED|LEGACY_ROUTE_DISABLED".into()),
///     ..Default::default()
/// });
/// assert_eq!(decision.route, MappingRoute::Blocked);
/// ```
pub fn resolve_mapping_decision(input: &MappingInput) -> MappingDecision {
    let refuse = |reason: String| {
        if input.mode == MappingMode::ForceNative {
            MappingDecision::new(MappingRoute::Blocked, reason)
        } else {
            MappingDecision::new(MappingRoute::Fallback, reason)
        }
    };
    let or_default = |value: &Option<String>, default: &str| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    };

    if input.mode == MappingMode::Off {
        return MappingDecision::new(MappingRoute::Fallback, "MODE_OFF");
    }

    if !input.native_route_enabled {
        return refuse(or_default(&input.native_route_reason, "NATIVE_ROUTE_DISABLED"));
    }

    if !input.probe_supported {
        return refuse(or_default(&input.probe_reason, "NATIVE_UNAVAILABLE"));
    }

    if input.mode == MappingMode::Auto && !input.hdr_active {
        return MappingDecision::new(
            MappingRoute::Fallback,
            or_default(&input.probe_reason, "HDR_INACTIVE"),
        );
    }

    match &input.native_start {
        None => MappingDecision::new(MappingRoute::Native, "NATIVE_READY"),
        Some(Ok(())) => MappingDecision::new(MappingRoute::Native, "NATIVE_OK"),
        Some(Err(reason)) => {
            let reason = if reason.is_empty() {
                "START_FAILED".to_string()
            } else {
                reason.clone()
            };
            refuse(reason)
        }
    }
}
