//! Fallback triggers and the tier transition table

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    error::FailureReason,
    model::RuntimeRoute,
    worker::{PumpReport, protocol::WorkerState},
};

/// Why the coordinator is leaving the current tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackTrigger {
    /// The worker reported a reason that never recovers on the same tier
    HardFailure(FailureReason),
    /// Consecutive read failures reached the configured limit
    ReadFailures(u32),
    /// No frame for at least the stall budget
    Stalled { idle_ms: u64 },
    /// The backend asked to be replaced
    Recommended,
    /// The worker escalated for another reason
    WorkerError(FailureReason),
    WorkerExited,
}

impl FallbackTrigger {
    /// Reason code written to the trace
    pub fn reason(&self) -> String {
        match self {
            FallbackTrigger::HardFailure(reason) | FallbackTrigger::WorkerError(reason) => {
                reason.as_str().to_string()
            }
            FallbackTrigger::ReadFailures(_) => FailureReason::ReadFailed.as_str().to_string(),
            FallbackTrigger::Stalled { .. } => FailureReason::NoFrame.as_str().to_string(),
            FallbackTrigger::Recommended => "FALLBACK_RECOMMENDED".to_string(),
            FallbackTrigger::WorkerExited => FailureReason::WorkerExited.as_str().to_string(),
        }
    }
}

/// Limits the supervisor checks reports against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerLimits {
    pub read_failure_limit: u32,
    pub stall_idle:         Duration,
}

/// Checks one pump report for a fallback trigger
///
/// Hard reasons win over counters, counters over the recommendation flag,
/// and the idle check runs last because it only applies while capturing.
pub fn detect_trigger(report: &PumpReport, now: Instant, limits: TriggerLimits) -> Option<FallbackTrigger> {
    if let Some(failure) = &report.last_failure {
        if failure.reason.is_hard_fallback() {
            return Some(FallbackTrigger::HardFailure(failure.reason));
        }
    }
    if report.read_failures >= limits.read_failure_limit {
        return Some(FallbackTrigger::ReadFailures(report.read_failures));
    }
    if report.fallback_recommended {
        return Some(FallbackTrigger::Recommended);
    }
    match report.state {
        WorkerState::Error => {
            let reason = report
                .last_failure
                .as_ref()
                .map_or(FailureReason::ReadFailed, |failure| failure.reason);
            Some(FallbackTrigger::WorkerError(reason))
        }
        WorkerState::Capturing => {
            let idle = report.idle_for(now)?;
            (idle >= limits.stall_idle).then(|| FallbackTrigger::Stalled {
                idle_ms: idle.as_millis() as u64,
            })
        }
        _ => None,
    }
}

/// Next step after a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// Restart the same session on the legacy backend
    RetryLegacy,
    /// Give up on native capture for the rest of the session
    Builtin,
}

/// Transition table: wgc gets one legacy retry, everything else goes builtin
///
/// The retry flag is not re-armed; a session that recovered on legacy and
/// then fails again goes straight to the builtin tier.
pub fn plan_fallback(route: RuntimeRoute, legacy_retry_attempted: bool, legacy_enabled: bool) -> FallbackAction {
    match route {
        RuntimeRoute::WgcV1 if !legacy_retry_attempted && legacy_enabled => FallbackAction::RetryLegacy,
        _ => FallbackAction::Builtin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;

    const LIMITS: TriggerLimits = TriggerLimits {
        read_failure_limit: 8,
        stall_idle:         Duration::from_millis(2000),
    };

    fn capturing(now: Instant) -> PumpReport {
        PumpReport {
            state: WorkerState::Capturing,
            started_at: Some(now),
            last_frame_at: Some(now),
            ..PumpReport::default()
        }
    }

    #[test]
    fn test_healthy_report_has_no_trigger() {
        let now = Instant::now();
        assert_eq!(detect_trigger(&capturing(now), now + Duration::from_millis(100), LIMITS), None);
        assert_eq!(detect_trigger(&PumpReport::default(), now, LIMITS), None);
    }

    #[test]
    fn test_hard_reason_triggers_immediately() {
        let now = Instant::now();
        for reason in [
            FailureReason::FrameTooLarge,
            FailureReason::InvalidSession,
            FailureReason::NativeUnavailable,
        ] {
            let report = PumpReport {
                read_failures: 1,
                last_failure: Some(Failure::new(reason, "boom")),
                ..capturing(now)
            };
            assert_eq!(detect_trigger(&report, now, LIMITS), Some(FallbackTrigger::HardFailure(reason)));
        }
    }

    #[test]
    fn test_read_failure_threshold() {
        let now = Instant::now();
        let mut report = PumpReport {
            read_failures: 7,
            last_failure: Some(Failure::new(FailureReason::ReadFailed, "flaky")),
            ..capturing(now)
        };
        assert_eq!(detect_trigger(&report, now, LIMITS), None);

        report.read_failures = 8;
        let trigger = detect_trigger(&report, now, LIMITS).unwrap();
        assert_eq!(trigger, FallbackTrigger::ReadFailures(8));
        assert_eq!(trigger.reason(), "READ_FAILED");
    }

    #[test]
    fn test_stall_after_idle_budget() {
        let now = Instant::now();
        let report = capturing(now);

        assert_eq!(detect_trigger(&report, now + Duration::from_millis(1999), LIMITS), None);
        assert_eq!(
            detect_trigger(&report, now + Duration::from_millis(2000), LIMITS),
            Some(FallbackTrigger::Stalled { idle_ms: 2000 })
        );
    }

    #[test]
    fn test_idle_is_ignored_outside_capture() {
        let now = Instant::now();
        let report = PumpReport {
            state: WorkerState::Idle,
            ..capturing(now)
        };
        assert_eq!(detect_trigger(&report, now + Duration::from_secs(10), LIMITS), None);
    }

    #[test]
    fn test_recommendation_and_worker_error() {
        let now = Instant::now();
        let recommended = PumpReport {
            fallback_recommended: true,
            ..capturing(now)
        };
        assert_eq!(detect_trigger(&recommended, now, LIMITS), Some(FallbackTrigger::Recommended));

        let errored = PumpReport {
            state: WorkerState::Error,
            ..PumpReport::default()
        };
        assert_eq!(
            detect_trigger(&errored, now, LIMITS),
            Some(FallbackTrigger::WorkerError(FailureReason::ReadFailed))
        );
    }

    #[test]
    fn test_plan_gives_wgc_one_legacy_retry() {
        assert_eq!(plan_fallback(RuntimeRoute::WgcV1, false, true), FallbackAction::RetryLegacy);
        assert_eq!(plan_fallback(RuntimeRoute::WgcV1, true, true), FallbackAction::Builtin);
        assert_eq!(plan_fallback(RuntimeRoute::WgcV1, false, false), FallbackAction::Builtin);
        assert_eq!(plan_fallback(RuntimeRoute::NativeLegacy, false, true), FallbackAction::Builtin);
    }
}
