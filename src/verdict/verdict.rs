/// Verdict classification
/// A pure function over the evidence bundle: the same evidence always yields
/// the same verdict.
use crate::config::types::{
    EvidenceBundle, ExecutionStatus, LimitSnapshot, WaitOutcome, WatchdogBreach,
};
use crate::kernel::signal::signal_name;

/// Which piece of evidence decided the status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictCause {
    WallTimer,
    OomKill,
    ProcessLimit,
    MemoryPeak,
    OutputSignal,
    OutputOverflow,
    FatalSignal,
    UserTimeWatchdog,
    CpuSignal,
    UserTimeUsage,
    KernelTimeUsage,
    NonzeroExit,
    NormalExit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub status: ExecutionStatus,
    pub cause: VerdictCause,
    /// Exit code, or 128 + signal number
    pub exit_code: i32,
    pub signal: Option<String>,
    pub is_oom: bool,
    pub is_wall_tle: bool,
    pub is_user_tle: bool,
    pub is_system_tle: bool,
}

/// Verdict classifier - pure function over evidence bundle
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify execution outcome based on evidence, in strict priority order
    pub fn classify(evidence: &EvidenceBundle, limits: &LimitSnapshot) -> Verdict {
        let memory_cause = Self::memory_cause(evidence, limits);
        let output_cause = Self::output_cause(evidence);
        let user_time_cause = Self::user_time_cause(evidence, limits);
        let kernel_exceeded = matches!(
            limits.kernel_time_ms,
            Some(bound) if evidence.cpu_kernel_ms > bound
        );
        let wall_exceeded = evidence.breach == Some(WatchdogBreach::WallTime);

        let (status, cause) = if wall_exceeded {
            (ExecutionStatus::TimeLimitExceeded, VerdictCause::WallTimer)
        } else if let Some(cause) = memory_cause {
            (ExecutionStatus::MemoryLimitExceeded, cause)
        } else if let Some(cause) = output_cause {
            (ExecutionStatus::OutputLimitExceeded, cause)
        } else if Self::is_fatal_signal(evidence) {
            (ExecutionStatus::SignalTerminate, VerdictCause::FatalSignal)
        } else if let Some(cause) = user_time_cause {
            (ExecutionStatus::UserTimeLimitExceeded, cause)
        } else if kernel_exceeded {
            (ExecutionStatus::UserTimeLimitExceeded, VerdictCause::KernelTimeUsage)
        } else {
            match evidence.wait_outcome {
                WaitOutcome::Exited(0) => (ExecutionStatus::Normal, VerdictCause::NormalExit),
                _ => (ExecutionStatus::RuntimeError, VerdictCause::NonzeroExit),
            }
        };

        let (exit_code, signal) = match evidence.wait_outcome {
            WaitOutcome::Exited(code) => (code, None),
            WaitOutcome::Signaled(sig) => (
                128 + sig,
                Some(signal_name(sig).map_or_else(|| format!("SIG{}", sig), str::to_string)),
            ),
        };

        Verdict {
            status,
            cause,
            exit_code,
            signal,
            is_oom: memory_cause.is_some(),
            is_wall_tle: wall_exceeded,
            is_user_tle: user_time_cause.is_some(),
            is_system_tle: kernel_exceeded,
        }
    }

    fn memory_cause(evidence: &EvidenceBundle, limits: &LimitSnapshot) -> Option<VerdictCause> {
        let cgroup = evidence.cgroup.unwrap_or_default();
        if cgroup.oom_kill_events > 0 {
            return Some(VerdictCause::OomKill);
        }
        if evidence.breach == Some(WatchdogBreach::ProcessLimit) || cgroup.pids_limit_events > 0 {
            return Some(VerdictCause::ProcessLimit);
        }
        match limits.memory_bytes {
            Some(limit) if evidence.memory_peak_bytes >= limit => Some(VerdictCause::MemoryPeak),
            _ => None,
        }
    }

    fn output_cause(evidence: &EvidenceBundle) -> Option<VerdictCause> {
        if evidence.wait_outcome == WaitOutcome::Signaled(libc::SIGXFSZ) {
            Some(VerdictCause::OutputSignal)
        } else if evidence.output_overflow {
            Some(VerdictCause::OutputOverflow)
        } else {
            None
        }
    }

    /// An uncaught signal that no limit explains
    fn is_fatal_signal(evidence: &EvidenceBundle) -> bool {
        match evidence.wait_outcome {
            WaitOutcome::Signaled(sig) => {
                sig != libc::SIGXCPU && evidence.breach != Some(WatchdogBreach::UserTime)
            }
            WaitOutcome::Exited(_) => false,
        }
    }

    fn user_time_cause(evidence: &EvidenceBundle, limits: &LimitSnapshot) -> Option<VerdictCause> {
        if evidence.breach == Some(WatchdogBreach::UserTime) {
            return Some(VerdictCause::UserTimeWatchdog);
        }
        if evidence.wait_outcome == WaitOutcome::Signaled(libc::SIGXCPU) {
            return Some(VerdictCause::CpuSignal);
        }
        match limits.user_time_ms {
            Some(bound) if evidence.cpu_user_ms > bound => Some(VerdictCause::UserTimeUsage),
            _ => None,
        }
    }
}

/// Shorthand for [`VerdictClassifier::classify`]
pub fn classify(evidence: &EvidenceBundle, limits: &LimitSnapshot) -> Verdict {
    VerdictClassifier::classify(evidence, limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CgroupEvidence;

    fn evidence(outcome: WaitOutcome) -> EvidenceBundle {
        EvidenceBundle {
            wait_outcome: outcome,
            breach: None,
            cgroup: Some(CgroupEvidence::default()),
            output_overflow: false,
            wall_time_ms: 15,
            cpu_user_ms: 5,
            cpu_kernel_ms: 1,
            memory_peak_bytes: 4 << 20,
        }
    }

    fn limits() -> LimitSnapshot {
        LimitSnapshot {
            wall_time_ms: Some(2000),
            user_time_ms: Some(1000),
            kernel_time_ms: None,
            memory_bytes: Some(64 << 20),
            memory_swap_bytes: None,
        }
    }

    #[test]
    fn test_classify_ok() {
        let verdict = classify(&evidence(WaitOutcome::Exited(0)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::Normal);
        assert_eq!(verdict.exit_code, 0);
        assert_eq!(verdict.signal, None);
        assert!(!verdict.is_oom && !verdict.is_wall_tle && !verdict.is_user_tle);
    }

    #[test]
    fn test_classify_runtime_error() {
        let verdict = classify(&evidence(WaitOutcome::Exited(3)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::RuntimeError);
        assert_eq!(verdict.exit_code, 3);
    }

    #[test]
    fn test_classify_fatal_signal() {
        let verdict = classify(&evidence(WaitOutcome::Signaled(libc::SIGSEGV)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::SignalTerminate);
        assert_eq!(verdict.exit_code, 128 + libc::SIGSEGV);
        assert_eq!(verdict.signal.as_deref(), Some("SIGSEGV"));
    }

    #[test]
    fn wall_timer_outranks_everything() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGKILL));
        bundle.breach = Some(WatchdogBreach::WallTime);
        bundle.cgroup = Some(CgroupEvidence {
            oom_kill_events: 1,
            ..CgroupEvidence::default()
        });
        bundle.output_overflow = true;

        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::TimeLimitExceeded);
        assert!(verdict.is_wall_tle);
        assert!(verdict.is_oom);
    }

    #[test]
    fn oom_kill_is_memory_limit_exceeded() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGKILL));
        bundle.cgroup = Some(CgroupEvidence {
            oom_kill_events: 1,
            ..CgroupEvidence::default()
        });
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::MemoryLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::OomKill);
        assert_eq!(verdict.signal.as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn peak_at_limit_is_memory_limit_exceeded() {
        let mut bundle = evidence(WaitOutcome::Exited(1));
        bundle.memory_peak_bytes = 64 << 20;
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::MemoryLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::MemoryPeak);
    }

    #[test]
    fn fork_bomb_is_memory_limit_exceeded() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGKILL));
        bundle.breach = Some(WatchdogBreach::ProcessLimit);
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::MemoryLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::ProcessLimit);

        let mut bundle = evidence(WaitOutcome::Exited(1));
        bundle.cgroup = Some(CgroupEvidence {
            pids_limit_events: 4,
            ..CgroupEvidence::default()
        });
        assert_eq!(classify(&bundle, &limits()).status, ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn memory_outranks_output() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGXFSZ));
        bundle.cgroup = Some(CgroupEvidence {
            oom_kill_events: 1,
            ..CgroupEvidence::default()
        });
        assert_eq!(classify(&bundle, &limits()).status, ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn sigxfsz_is_output_limit_exceeded() {
        let verdict = classify(&evidence(WaitOutcome::Signaled(libc::SIGXFSZ)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::OutputLimitExceeded);
        assert_eq!(verdict.signal.as_deref(), Some("SIGXFSZ"));
    }

    #[test]
    fn handled_sigxfsz_without_overflow_falls_through() {
        // The program caught SIGXFSZ and exited on its own
        let verdict = classify(&evidence(WaitOutcome::Exited(0)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::Normal);

        let mut bundle = evidence(WaitOutcome::Exited(0));
        bundle.output_overflow = true;
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::OutputLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::OutputOverflow);
    }

    #[test]
    fn output_outranks_signal() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGABRT));
        bundle.output_overflow = true;
        assert_eq!(classify(&bundle, &limits()).status, ExecutionStatus::OutputLimitExceeded);
    }

    #[test]
    fn watchdog_cpu_kill_is_user_time_exceeded() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGKILL));
        bundle.breach = Some(WatchdogBreach::UserTime);
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::UserTimeLimitExceeded);
        assert!(verdict.is_user_tle);
        assert_eq!(verdict.exit_code, 128 + libc::SIGKILL);
    }

    #[test]
    fn sigxcpu_is_user_time_exceeded() {
        let verdict = classify(&evidence(WaitOutcome::Signaled(libc::SIGXCPU)), &limits());
        assert_eq!(verdict.status, ExecutionStatus::UserTimeLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::CpuSignal);
    }

    #[test]
    fn usage_over_bound_is_user_time_exceeded() {
        let mut bundle = evidence(WaitOutcome::Exited(0));
        bundle.cpu_user_ms = 1001;
        assert_eq!(classify(&bundle, &limits()).status, ExecutionStatus::UserTimeLimitExceeded);

        bundle.cpu_user_ms = 1000;
        assert_eq!(classify(&bundle, &limits()).status, ExecutionStatus::Normal);
    }

    #[test]
    fn kernel_time_over_bound_is_a_cpu_overrun() {
        let bounded = LimitSnapshot {
            kernel_time_ms: Some(100),
            ..limits()
        };
        let mut bundle = evidence(WaitOutcome::Exited(0));
        bundle.cpu_kernel_ms = 150;

        let verdict = classify(&bundle, &bounded);
        assert_eq!(verdict.status, ExecutionStatus::UserTimeLimitExceeded);
        assert_eq!(verdict.cause, VerdictCause::KernelTimeUsage);
        assert!(verdict.is_system_tle);
        assert!(!verdict.is_user_tle);

        // Flagged even when a higher-priority status wins
        bundle.wait_outcome = WaitOutcome::Signaled(libc::SIGSEGV);
        let verdict = classify(&bundle, &bounded);
        assert_eq!(verdict.status, ExecutionStatus::SignalTerminate);
        assert!(verdict.is_system_tle);

        bundle.cpu_kernel_ms = 100;
        bundle.wait_outcome = WaitOutcome::Exited(0);
        assert!(!classify(&bundle, &bounded).is_system_tle);
    }

    #[test]
    fn fatal_signal_outranks_usage_over_bound() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGSEGV));
        bundle.cpu_user_ms = 5000;
        let verdict = classify(&bundle, &limits());
        assert_eq!(verdict.status, ExecutionStatus::SignalTerminate);
        assert!(verdict.is_user_tle);
    }

    #[test]
    fn unbounded_limits_never_trip() {
        let mut bundle = evidence(WaitOutcome::Exited(0));
        bundle.cgroup = None;
        bundle.cpu_user_ms = u64::MAX;
        bundle.memory_peak_bytes = u64::MAX;
        let verdict = classify(&bundle, &LimitSnapshot::default());
        assert_eq!(verdict.status, ExecutionStatus::Normal);
    }

    #[test]
    fn classification_is_deterministic() {
        let mut bundle = evidence(WaitOutcome::Signaled(libc::SIGKILL));
        bundle.breach = Some(WatchdogBreach::UserTime);
        assert_eq!(classify(&bundle, &limits()), classify(&bundle, &limits()));
    }
}
