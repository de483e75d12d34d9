//! Owned handle of the sandbox init process and its process group.

use crate::config::types::{Result, RunnerError, WaitOutcome};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

/// Kill and reap happen at most once, and always happen by the time the
/// handle is dropped.
#[derive(Debug)]
pub struct RunGroup {
    pid: Pid,
    killed: AtomicBool,
    reaped: AtomicBool,
}

impl RunGroup {
    /// Take ownership of a freshly cloned init process
    pub fn new(pid: Pid) -> Self {
        // The child does the same; whichever runs first wins
        let _ = nix::unistd::setpgid(pid, pid);
        Self {
            pid,
            killed: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// SIGKILL the whole group. Returns true for the call that sent it.
    ///
    /// Safe to race with [`RunGroup::wait_for_exit`]: the init process stays
    /// a zombie until [`RunGroup::reap`], so its pid cannot be recycled.
    pub fn kill(&self) -> bool {
        if self.is_reaped() || self.killed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Err(e) = kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGKILL) {
            if e != Errno::ESRCH {
                log::warn!("SIGKILL to group {} failed: {}", self.pid, e);
            }
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        log::debug!("Killed run group {}", self.pid);
        true
    }

    /// Block until the init process exits without reaping it
    pub fn wait_for_exit(&self) -> Result<()> {
        loop {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid.as_raw() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(RunnerError::Process(format!(
                    "waitid(init {}) failed: {}",
                    self.pid, err
                )));
            }
        }
    }

    /// Collect the exit status. Only the first call reaps.
    pub fn reap(&self) -> Result<WaitOutcome> {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::Process(format!(
                "init process {} was already reaped",
                self.pid
            )));
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(WaitOutcome::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(WaitOutcome::Signaled(sig as i32)),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(RunnerError::Process(format!(
                        "waitpid(init {}) failed: {}",
                        self.pid, e
                    )))
                }
            }
        }
    }
}

impl Drop for RunGroup {
    fn drop(&mut self) {
        if self.is_reaped() {
            return;
        }
        self.kill();
        if let Err(e) = self.reap() {
            log::warn!("Failed to reap run group {}: {}", self.pid, e);
        }
    }
}
