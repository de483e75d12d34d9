use crate::config::types::{ExecutionConfig, WaitOutcome, WatchdogBreach};
use crate::kernel::mount::plan::MountPlan;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// Host-opened descriptors the payload's standard streams are dup'ed from.
/// `None` keeps the stream the init process inherited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioFds {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
}

/// Supervisor->init launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub run_id: String,
    pub config: ExecutionConfig,
    pub plan: MountPlan,
    pub stdio: StdioFds,
}

/// Init->supervisor status payload transferred through the status pipe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub payload_pid: Option<i32>,
    pub payload_exit: Option<WaitOutcome>,
    /// rusage of the payload and every reaped descendant
    pub cpu_user_ms: u64,
    pub cpu_kernel_ms: u64,
    pub max_rss_kib: u64,
    pub wall_time_ms: u64,
    pub internal_error: Option<String>,
    pub reaped_descendants: u32,
}

/// What ended the supervision early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogEvent {
    Breach(WatchdogBreach),
    /// The runner itself was asked to stop
    Cancelled(i32),
}

/// Everything the supervisor observed about one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisedRun {
    /// Status reported by the init process; `None` when it was killed first
    pub proxy_status: Option<ProxyStatus>,
    pub init_outcome: WaitOutcome,
    pub event: Option<WatchdogEvent>,
    pub wall_time_ms: u64,
    pub output_overflow: bool,
}

impl SupervisedRun {
    pub fn breach(&self) -> Option<WatchdogBreach> {
        match self.event {
            Some(WatchdogEvent::Breach(breach)) => Some(breach),
            _ => None,
        }
    }

    /// How the payload ended; a killed init process stands in for it
    pub fn payload_outcome(&self) -> WaitOutcome {
        self.proxy_status
            .as_ref()
            .and_then(|status| status.payload_exit)
            .unwrap_or(self.init_outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_init_stands_in_for_payload() {
        let run = SupervisedRun {
            proxy_status: None,
            init_outcome: WaitOutcome::Signaled(libc::SIGKILL),
            event: Some(WatchdogEvent::Breach(WatchdogBreach::WallTime)),
            wall_time_ms: 2000,
            output_overflow: false,
        };
        assert_eq!(run.payload_outcome(), WaitOutcome::Signaled(libc::SIGKILL));
        assert_eq!(run.breach(), Some(WatchdogBreach::WallTime));
    }

    #[test]
    fn reported_payload_outcome_wins() {
        let run = SupervisedRun {
            proxy_status: Some(ProxyStatus {
                payload_exit: Some(WaitOutcome::Exited(3)),
                ..ProxyStatus::default()
            }),
            init_outcome: WaitOutcome::Exited(0),
            event: Some(WatchdogEvent::Cancelled(libc::SIGTERM)),
            wall_time_ms: 10,
            output_overflow: false,
        };
        assert_eq!(run.payload_outcome(), WaitOutcome::Exited(3));
        assert_eq!(run.breach(), None);
    }
}
