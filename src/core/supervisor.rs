use crate::config::types::{ExecutionConfig, Result, RunnerError, StdioTarget, WaitOutcome};
use crate::core::proxy::{read_proxy_status_from_fd, run_proxy_main_from_fds, write_request_to_fd};
use crate::core::run_group::RunGroup;
use crate::core::types::{LaunchRequest, StdioFds, SupervisedRun, WatchdogEvent};
use crate::core::watchdog::{Watchdog, WatchdogLimits};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::mount::MountPlan;
use crate::kernel::namespace::{write_id_maps, NamespaceIsolation};
use crate::kernel::signal::SignalHandler;
use nix::sched::clone;
use nix::unistd::{close, pipe};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

const CLONE_STACK_SIZE: usize = 2 * 1024 * 1024;
const OUTPUT_FILE_MODE: u32 = 0o664;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> RunnerError {
    RunnerError::Process(format!("{prefix}: {err}"))
}

/// Redirection targets opened on the host before the sandbox exists.
/// Kept open for the whole run so their size can be checked afterwards.
#[derive(Debug, Default)]
pub struct StdioFiles {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

fn open_output(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(OUTPUT_FILE_MODE)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| RunnerError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))))
}

fn open_input(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| RunnerError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))))
}

impl StdioFiles {
    pub fn open(config: &crate::config::types::StdioConfig) -> Result<Self> {
        let null = Path::new("/dev/null");
        let stdin = match &config.stdin {
            StdioTarget::Inherit => None,
            StdioTarget::Null => Some(open_input(null)?),
            StdioTarget::File(path) => Some(open_input(path)?),
        };
        let output = |target: &StdioTarget| -> Result<Option<File>> {
            match target {
                StdioTarget::Inherit => Ok(None),
                StdioTarget::Null => open_output(null).map(Some),
                StdioTarget::File(path) => open_output(path).map(Some),
            }
        };
        Ok(Self {
            stdin,
            stdout: output(&config.stdout)?,
            stderr: output(&config.stderr)?,
        })
    }

    pub fn fds(&self) -> StdioFds {
        StdioFds {
            stdin: self.stdin.as_ref().map(AsRawFd::as_raw_fd),
            stdout: self.stdout.as_ref().map(AsRawFd::as_raw_fd),
            stderr: self.stderr.as_ref().map(AsRawFd::as_raw_fd),
        }
    }

    /// A redirected output file grew past `limit` bytes. /dev/null never does.
    pub fn exceeds(&self, limit: u64) -> bool {
        [&self.stdout, &self.stderr].into_iter().flatten().any(|file| {
            file.metadata()
                .map(|meta| meta.is_file() && meta.len() > limit)
                .unwrap_or(false)
        })
    }
}

fn close_all(fds: &[RawFd]) {
    for fd in fds {
        let _ = close(*fd);
    }
}

/// Launch one run: supervisor -> init (clone, PID 1 of the sandbox) -> payload.
///
/// Returns once the init process has been reaped. Every process of the run is
/// dead by then, whatever path was taken.
pub fn launch(
    run_id: &str,
    config: &ExecutionConfig,
    plan: &MountPlan,
    cgroup: Option<&dyn CgroupBackend>,
    signals: Option<SignalHandler>,
) -> Result<SupervisedRun> {
    let stdio = StdioFiles::open(&config.stdio)?;
    let request = LaunchRequest {
        run_id: run_id.to_string(),
        config: config.clone(),
        plan: plan.clone(),
        stdio: stdio.fds(),
    };

    let (launch_read, launch_write) = pipe().map_err(|e| to_process_error("pipe(launch)", e))?;
    let (status_read, status_write) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close_all(&[launch_read, launch_write]);
            return Err(to_process_error("pipe(status)", e));
        }
    };

    let isolation = NamespaceIsolation::from_config(&config.namespaces);
    log::debug!("Cloning init with namespaces {:?}", isolation.enabled_namespaces());

    let mut child_stack = vec![0u8; CLONE_STACK_SIZE];
    let child_cb: Box<dyn FnMut() -> isize> = Box::new(move || {
        // Without this the child holds launch_write open and never sees EOF
        let _ = close(launch_write);
        let _ = close(status_read);
        run_proxy_main_from_fds(launch_read, status_write)
    });

    let clone_result = unsafe {
        clone(
            child_cb,
            &mut child_stack,
            isolation.clone_flags(),
            Some(libc::SIGCHLD),
        )
    };
    close_all(&[launch_read, status_write]);

    let init_pid = match clone_result {
        Ok(pid) => pid,
        Err(e) => {
            close_all(&[launch_write, status_read]);
            return Err(RunnerError::Namespace(format!("clone(init) failed: {}", e)));
        }
    };
    let group = RunGroup::new(init_pid);
    log::debug!("[{}] init process {}", run_id, init_pid);

    let prepared = write_id_maps(init_pid, &config.namespaces.user).and_then(|_| match cgroup {
        Some(backend) => backend.attach_process(init_pid.as_raw() as u32),
        None => Ok(()),
    });
    if let Err(e) = prepared {
        close_all(&[launch_write, status_read]);
        return Err(e);
    }

    if let Err(e) = write_request_to_fd(launch_write, &request) {
        close_all(&[status_read]);
        return Err(e);
    }

    let started = Instant::now();
    let limits = WatchdogLimits {
        wall_time: config.limits.wall_time_ms.map(Duration::from_millis),
        user_time_usec: config.limits.user_time_ms.map(|ms| ms.saturating_mul(1000)),
        pids_limited: config.limits.cgroup.pids.is_some(),
    };

    let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
    let (exited, event) = std::thread::scope(|scope| {
        let watchdog = Watchdog::new(&group, cgroup, limits, signals, started);
        let handle = scope.spawn(move || watchdog.run(cancel_rx));

        let exited = group.wait_for_exit();
        let _ = cancel_tx.send(());
        let event = handle.join().unwrap_or_else(|_| {
            log::error!("Watchdog thread panicked");
            None
        });
        (exited, event)
    });
    let wall_time_ms = started.elapsed().as_millis() as u64;

    if let Err(e) = exited {
        close_all(&[status_read]);
        return Err(e);
    }
    let init_outcome = group.reap()?;

    let proxy_status = match read_proxy_status_from_fd(status_read) {
        Ok(status) => Some(status),
        Err(e) if status_may_be_missing(event.as_ref(), init_outcome) => {
            log::debug!("No status from killed init process: {}", e);
            None
        }
        Err(e) => {
            return Err(RunnerError::Process(format!(
                "init process exited ({:?}) without a status: {}",
                init_outcome, e
            )))
        }
    };

    let output_overflow = config
        .limits
        .output_limit_bytes()
        .map(|limit| stdio.exceeds(limit))
        .unwrap_or(false);

    log::debug!(
        "[{}] init exited {:?} after {}ms, watchdog event {:?}",
        run_id,
        init_outcome,
        wall_time_ms,
        event
    );

    Ok(SupervisedRun {
        proxy_status,
        init_outcome,
        event,
        wall_time_ms,
        output_overflow,
    })
}

/// init only dies without a status when something SIGKILLed it: the
/// watchdog, or the OOM killer taking the whole cgroup with `memory.oom.group`
fn status_may_be_missing(event: Option<&WatchdogEvent>, init_outcome: WaitOutcome) -> bool {
    event.is_some() || init_outcome == WaitOutcome::Signaled(libc::SIGKILL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StdioConfig;
    use std::io::Write;

    #[test]
    fn output_files_are_truncated_and_checked_against_limit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        std::fs::write(&out, "stale contents that must disappear").unwrap();

        let config = StdioConfig {
            stdin: StdioTarget::Null,
            stdout: StdioTarget::File(out.clone()),
            stderr: StdioTarget::Inherit,
        };
        let files = StdioFiles::open(&config).unwrap();
        assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);

        let fds = files.fds();
        assert!(fds.stdin.is_some());
        assert!(fds.stdout.is_some());
        assert_eq!(fds.stderr, None);

        files.stdout.as_ref().unwrap().write_all(&[b'x'; 10]).unwrap();
        assert!(!files.exceeds(10));
        assert!(files.exceeds(9));
    }

    #[test]
    fn dev_null_never_overflows() {
        let files = StdioFiles::open(&StdioConfig::default()).unwrap();
        files.stdout.as_ref().unwrap().write_all(b"discarded").unwrap();
        assert!(!files.exceeds(0));
    }

    #[test]
    fn output_file_gets_group_writable_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let err = dir.path().join("err.txt");
        let config = StdioConfig {
            stderr: StdioTarget::File(err.clone()),
            ..StdioConfig::default()
        };
        let _files = StdioFiles::open(&config).unwrap();
        let mode = std::fs::metadata(&err).unwrap().permissions().mode() & 0o777;
        // umask may only remove bits
        assert_eq!(mode & !0o664, 0);
    }

    #[test]
    fn missing_stdin_file_is_an_error() {
        let config = StdioConfig {
            stdin: StdioTarget::File("/nonexistent/runbox/input".into()),
            ..StdioConfig::default()
        };
        assert!(StdioFiles::open(&config).is_err());
    }

    #[test]
    fn only_a_killed_init_may_skip_its_status() {
        let killed = WaitOutcome::Signaled(libc::SIGKILL);
        let wall = WatchdogEvent::Breach(crate::config::types::WatchdogBreach::WallTime);

        assert!(status_may_be_missing(Some(&wall), killed));
        assert!(status_may_be_missing(None, killed));
        assert!(!status_may_be_missing(None, WaitOutcome::Exited(126)));
        assert!(!status_may_be_missing(None, WaitOutcome::Signaled(libc::SIGSEGV)));
    }
}
