use crate::config::types::{Result, RunnerError, WaitOutcome};
use crate::core::types::{LaunchRequest, ProxyStatus};
use crate::exec::preexec::{setup_parent_death_signal, FreshChild, RootReady, Sandbox};
use crate::kernel::credentials::become_namespace_root;
use crate::kernel::namespace::enter_cgroup_namespace;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, pipe2, setpgid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Exit code of the payload child when setup or exec failed
const SETUP_FAILURE_EXIT: i32 = 127;

fn to_runner_error(prefix: &str, err: impl std::fmt::Display) -> RunnerError {
    RunnerError::Process(format!("{prefix}: {err}"))
}

pub(crate) fn read_json_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| RunnerError::Process(format!("failed to decode json on fd {fd}: {e}")))
}

pub(crate) fn write_json_to_fd<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let payload = serde_json::to_vec(value)
        .map_err(|e| RunnerError::Process(format!("failed to encode json for fd {fd}: {e}")))?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

pub fn write_request_to_fd(fd: RawFd, req: &LaunchRequest) -> Result<()> {
    write_json_to_fd(fd, req)
}

pub fn read_proxy_status_from_fd(fd: RawFd) -> Result<ProxyStatus> {
    read_json_from_fd(fd)
}

/// Payload side of the fork: finish the chain and exec
fn exec_payload_with_typestate(
    sandbox: Sandbox<RootReady>,
    req: &LaunchRequest,
    error_fd: RawFd,
) -> Result<()> {
    sandbox
        .redirect_stdio(&req.stdio)?
        .apply_limits(&req.config, &[error_fd])?
        .drop_credentials(req.config.user)?
        .lock_privileges()?
        .ready_for_exec()
        .exec_payload(&req.config.command)
}

/// Read setup errors written by the payload before exec. EOF without data
/// means the close-on-exec end went away through a successful exec.
fn read_setup_error(fd: RawFd) -> Option<String> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut message = String::new();
    match file.read_to_string(&mut message) {
        Ok(_) if message.is_empty() => None,
        Ok(_) => Some(message),
        Err(e) => Some(format!("failed to read payload setup status: {e}")),
    }
}

fn wait_for_payload(payload_pid: Pid) -> Result<WaitOutcome> {
    loop {
        match waitpid(payload_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(WaitOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(WaitOutcome::Signaled(sig as i32)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_runner_error("waitpid(payload)", e)),
        }
    }
}

/// Kill whatever the payload left behind and reap every descendant.
/// As PID 1 of the namespace, kill(-1) reaches exactly the sandbox.
fn reap_descendants() -> Result<u32> {
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);

    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(_) => reaped += 1,
            Err(Errno::ECHILD) => return Ok(reaped),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_runner_error("waitpid(reap)", e)),
        }
    }
}

fn timeval_ms(tv: nix::sys::time::TimeVal) -> u64 {
    (tv.tv_sec() as u64) * 1000 + (tv.tv_usec() as u64) / 1000
}

fn run_proxy(req: LaunchRequest) -> Result<ProxyStatus> {
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    setup_parent_death_signal()?;

    // The maps are written by the supervisor before the request arrives
    if req.config.namespaces.user.creates_user_namespace() {
        become_namespace_root()?;
    }
    // Attached to the run cgroup by now
    if let Err(e) = enter_cgroup_namespace() {
        log::warn!("{}; payload sees the host cgroup tree", e);
    }

    let sandbox = Sandbox::<FreshChild>::new(req.run_id.clone())
        .harden_mount_propagation()?
        .assemble_root(&req.plan, &req.config)?;

    let (error_read, error_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_runner_error("pipe(exec error)", e))?;

    let start = Instant::now();
    let payload_pid = match unsafe { fork() }.map_err(|e| to_runner_error("fork(payload)", e))? {
        ForkResult::Child => {
            let _ = close(error_read);
            if let Err(err) = exec_payload_with_typestate(sandbox, &req, error_write) {
                let mut channel = unsafe { File::from_raw_fd(error_write) };
                let _ = write!(channel, "{err}");
            }
            unsafe { libc::_exit(SETUP_FAILURE_EXIT) };
        }
        ForkResult::Parent { child } => child,
    };

    let _ = close(error_write);
    let setup_error = read_setup_error(error_read);

    let payload_exit = wait_for_payload(payload_pid)?;
    let wall_time_ms = start.elapsed().as_millis() as u64;
    let reaped_descendants = reap_descendants()?;

    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).map_err(|e| to_runner_error("getrusage", e))?;

    Ok(ProxyStatus {
        payload_pid: Some(payload_pid.as_raw()),
        payload_exit: if setup_error.is_some() { None } else { Some(payload_exit) },
        cpu_user_ms: timeval_ms(usage.user_time()),
        cpu_kernel_ms: timeval_ms(usage.system_time()),
        max_rss_kib: usage.max_rss().max(0) as u64,
        wall_time_ms,
        internal_error: setup_error.map(|e| format!("payload setup failed: {e}")),
        reaped_descendants,
    })
}

/// Child entrypoint executed by the clone()-created init process.
pub fn run_proxy_main_from_fds(launch_fd: RawFd, status_fd: RawFd) -> ! {
    let outcome = match read_json_from_fd::<LaunchRequest>(launch_fd).and_then(run_proxy) {
        Ok(status) => status,
        Err(err) => ProxyStatus {
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        },
    };

    let _ = write_json_to_fd(status_fd, &outcome);
    let code = if outcome.internal_error.is_some() { 126 } else { 0 };
    unsafe { libc::_exit(code) }
}
