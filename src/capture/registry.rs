//! Lazy backend loading with a per-registry cache
//!
//! A backend is loaded the first time the selector asks for it and the
//! outcome (backend or [`LoadError`]) is cached for the lifetime of the
//! registry. The registry is owned by the coordinator, not a process-wide
//! global.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CaptureBackend;
use crate::model::{RoutePreference, RuntimeRoute};

/// Native backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Windows Graphics Capture
    Wgc,
    /// Desktop Duplication
    Legacy,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Wgc => "wgc",
            BackendKind::Legacy => "legacy",
        }
    }

    /// Tier this backend runs as
    pub fn route(self) -> RuntimeRoute {
        match self {
            BackendKind::Wgc => RuntimeRoute::WgcV1,
            BackendKind::Legacy => RuntimeRoute::NativeLegacy,
        }
    }

    /// Inverse of [`route`](Self::route); `None` for the builtin tier
    pub fn from_route(route: RuntimeRoute) -> Option<Self> {
        match route {
            RuntimeRoute::WgcV1 => Some(BackendKind::Wgc),
            RuntimeRoute::NativeLegacy => Some(BackendKind::Legacy),
            RuntimeRoute::BuiltinDesktop => None,
        }
    }

    /// Preference that puts this backend first in the try order
    pub fn preference(self) -> RoutePreference {
        match self {
            BackendKind::Wgc => RoutePreference::Wgc,
            BackendKind::Legacy => RoutePreference::Legacy,
        }
    }

    /// Label reported when the backend does not name itself
    pub fn default_label(self) -> &'static str {
        match self {
            BackendKind::Wgc => "windows-wgc-hdr-capture",
            BackendKind::Legacy => "windows-hdr-capture",
        }
    }

    /// Skip reason when the route's enable flag is off
    pub fn disabled_reason(self) -> &'static str {
        match self {
            BackendKind::Wgc => "WGC_ROUTE_DISABLED",
            BackendKind::Legacy => "LEGACY_ROUTE_DISABLED",
        }
    }

    /// Skip reason when loading failed without a specific code
    pub fn unavailable_reason(self) -> &'static str {
        match self {
            BackendKind::Wgc => "WGC_UNAVAILABLE",
            BackendKind::Legacy => "LEGACY_UNAVAILABLE",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a backend could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct LoadError {
    /// Short code recorded in the selector's audit trail
    pub code:    String,
    pub message: String,
}

impl LoadError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code:    code.into(),
            message: message.into(),
        }
    }

    /// Generic "not present" error for `kind`
    pub fn unavailable(kind: BackendKind) -> Self {
        Self::new(
            kind.unavailable_reason(),
            format!("{} capture module is not present", kind),
        )
    }
}

/// Resolves a backend family to a concrete backend
///
/// Implementations may do expensive work (locating and initialising a
/// native module); the registry guarantees `load` runs at most once per
/// kind.
pub trait BackendLoader: Send + Sync {
    fn load(&self, kind: BackendKind) -> Result<Arc<dyn CaptureBackend>, LoadError>;
}

type LoadOutcome = Result<Arc<dyn CaptureBackend>, LoadError>;

/// Loaded-backend cache owned by one coordinator
pub struct BackendRegistry {
    loader: Box<dyn BackendLoader>,
    cache:  Mutex<HashMap<BackendKind, LoadOutcome>>,
}

impl BackendRegistry {
    pub fn new(loader: impl BackendLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            cache:  Mutex::new(HashMap::new()),
        }
    }

    /// Returns the backend for `kind`, loading it on first use
    ///
    /// Failures are cached too: a module that failed to load is not retried
    /// for the lifetime of the registry.
    pub fn resolve(&self, kind: BackendKind) -> LoadOutcome {
        let mut cache = self.cache.lock();
        if let Some(outcome) = cache.get(&kind) {
            return outcome.clone();
        }

        let outcome = self.loader.load(kind);
        match &outcome {
            Ok(backend) => tracing::info!(%kind, label = backend.label(), "capture backend loaded"),
            Err(error) => tracing::warn!(%kind, code = %error.code, "capture backend load failed: {}", error.message),
        }
        cache.insert(kind, outcome.clone());
        outcome
    }

    /// Whether `kind` has been loaded (successfully or not)
    pub fn is_resolved(&self, kind: BackendKind) -> bool {
        self.cache.lock().contains_key(&kind)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock();
        let mut kinds: Vec<_> = cache
            .iter()
            .map(|(kind, outcome)| (kind.as_str(), outcome.is_ok()))
            .collect();
        kinds.sort();
        f.debug_struct("BackendRegistry")
            .field("resolved", &kinds)
            .finish()
    }
}

/// Loader backed by a fixed table, for tests and the synthetic demo
#[derive(Default)]
pub struct StaticBackendLoader {
    backends:   HashMap<BackendKind, LoadOutcome>,
    load_calls: Arc<AtomicUsize>,
}

impl StaticBackendLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend for `kind`
    pub fn with_backend(mut self, kind: BackendKind, backend: Arc<dyn CaptureBackend>) -> Self {
        self.backends.insert(kind, Ok(backend));
        self
    }

    /// Makes loading `kind` fail with `error`
    pub fn with_failure(mut self, kind: BackendKind, error: LoadError) -> Self {
        self.backends.insert(kind, Err(error));
        self
    }

    /// Shared counter of `load` calls, readable after the loader is moved
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.load_calls)
    }
}

impl BackendLoader for StaticBackendLoader {
    fn load(&self, kind: BackendKind) -> LoadOutcome {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.backends
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Err(LoadError::unavailable(kind)))
    }
}
