//! Watchdog racing the supervisor's wait.
//!
//! Polls the wall clock, the cgroup's user CPU counter, the pids limit and
//! runner cancellation. The first condition that fires kills the run group and
//! is the only one recorded.

use crate::config::types::WatchdogBreach;
use crate::core::run_group::RunGroup;
use crate::core::types::WatchdogEvent;
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::signal::SignalHandler;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounds the watchdog enforces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub wall_time: Option<Duration>,
    pub user_time_usec: Option<u64>,
    /// Treat any pids.max rejection as fatal
    pub pids_limited: bool,
}

pub struct Watchdog<'a> {
    group: &'a RunGroup,
    cgroup: Option<&'a dyn CgroupBackend>,
    limits: WatchdogLimits,
    signals: Option<SignalHandler>,
    started: Instant,
    poll_interval: Duration,
}

impl<'a> Watchdog<'a> {
    pub fn new(
        group: &'a RunGroup,
        cgroup: Option<&'a dyn CgroupBackend>,
        limits: WatchdogLimits,
        signals: Option<SignalHandler>,
        started: Instant,
    ) -> Self {
        Self {
            group,
            cgroup,
            limits,
            signals,
            started,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until `cancel` fires or a condition trips
    pub fn run(&self, cancel: Receiver<()>) -> Option<WatchdogEvent> {
        loop {
            if let Some(event) = self.check() {
                self.group.kill();
                log::debug!("Watchdog fired: {:?}", event);
                return Some(event);
            }

            match cancel.recv_timeout(self.poll_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn check(&self) -> Option<WatchdogEvent> {
        if let Some(signals) = self.signals {
            if signals.cancellation_requested() {
                return Some(WatchdogEvent::Cancelled(signals.received_signal()));
            }
        }

        if let Some(wall) = self.limits.wall_time {
            if self.started.elapsed() >= wall {
                return Some(WatchdogEvent::Breach(WatchdogBreach::WallTime));
            }
        }

        let cgroup = self.cgroup?;

        if self.limits.pids_limited {
            match cgroup.pids_limit_hits() {
                Ok(hits) if hits > 0 => {
                    return Some(WatchdogEvent::Breach(WatchdogBreach::ProcessLimit))
                }
                Ok(_) => {}
                Err(e) => log::debug!("pids.events unreadable: {}", e),
            }
        }

        if let Some(bound) = self.limits.user_time_usec {
            match cgroup.cpu_usage() {
                Ok(usage) if usage.user_usec >= bound => {
                    return Some(WatchdogEvent::Breach(WatchdogBreach::UserTime))
                }
                Ok(_) => {}
                Err(e) => log::debug!("cpu usage unreadable: {}", e),
            }
        }

        None
    }
}
