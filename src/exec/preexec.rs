//! Pre-exec ordering enforcement
//!
//! The setup sequence is fixed:
//! 1. prctl(PR_SET_PDEATHSIG, SIGKILL) for the sandbox init
//! 2. mount propagation hardening: / becomes MS_PRIVATE | MS_REC
//! 3. hostname, loopback, mount assembly and pivot_root
//! 4. (fork) payload stdio redirection
//! 5. rlimits, umask, FD closure, environment, cwd
//! 6. setgroups, setresgid then setresuid
//! 7. drop capabilities, prctl(PR_SET_NO_NEW_PRIVS, 1)
//! 8. exec payload

use crate::config::types::{ExecutionConfig, Identity, Result, RunnerError};
use crate::core::types::StdioFds;
use crate::kernel::capabilities::{check_no_new_privs, current_ids, drop_all_capabilities, set_no_new_privs};
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::mount::{MountAssembler, MountPlan};
use crate::kernel::namespace::{bring_up_loopback, set_sandbox_hostname};
use crate::kernel::rlimit::{apply_rlimits, with_default_rlimits};
use nix::unistd::dup2;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const PAYLOAD_UMASK: u32 = 0o022;

/// `PATH` of the payload: the default search path followed by extra entries
pub fn payload_path(extra: &[String]) -> String {
    if extra.is_empty() {
        DEFAULT_PATH.to_string()
    } else {
        format!("{}:{}", DEFAULT_PATH, extra.join(":"))
    }
}

fn apply_exec_environment(vars: &[(&str, String)]) -> Result<()> {
    let clear_rc = unsafe { libc::clearenv() };
    if clear_rc != 0 {
        return Err(RunnerError::Process(format!(
            "clearenv failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    for (key, value) in vars {
        let key_c = CString::new(*key)
            .map_err(|_| RunnerError::config("paths", format!("{} contains a NUL byte", key)))?;
        let value_c = CString::new(value.as_str())
            .map_err(|_| RunnerError::config("paths", format!("{} value contains a NUL byte", key)))?;

        let rc = unsafe { libc::setenv(key_c.as_ptr(), value_c.as_ptr(), 1) };
        if rc != 0 {
            return Err(RunnerError::Process(format!(
                "setenv failed for {}: {}",
                key,
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

/// Setup parent death signal for child process
/// Must be called in the child right after clone/fork
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
        RunnerError::Process(format!("Failed to set parent death signal: {}", e))
    })?;

    log::debug!("Parent death signal (SIGKILL) configured");
    Ok(())
}

// Type-state pre-exec chain
//
// FreshChild -> MountsPrivate -> RootReady -> StdioReady -> LimitsApplied ->
// CredsDropped -> PrivsLocked -> ExecReady
//
// Each step consumes the prior state. Only Sandbox<ExecReady> can exec.

/// Type-state marker: fresh init process inside the new namespaces
pub struct FreshChild;

/// Type-state marker: mount propagation has been hardened
pub struct MountsPrivate;

/// Type-state marker: sandbox root assembled and pivoted into
pub struct RootReady;

/// Type-state marker: payload standard streams are connected
pub struct StdioReady;

/// Type-state marker: rlimits, umask, fds, environment and cwd are set
pub struct LimitsApplied;

/// Type-state marker: credentials have been dropped
pub struct CredsDropped;

/// Type-state marker: privileges have been locked down
pub struct PrivsLocked;

/// Type-state marker: ready for exec (all gates passed)
pub struct ExecReady;

/// Sandbox process with type-state tracking
pub struct Sandbox<S> {
    /// Run identifier
    pub run_id: String,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            run_id: self.run_id,
            _state: PhantomData,
        }
    }
}

impl Sandbox<FreshChild> {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            _state: PhantomData,
        }
    }

    /// Must succeed before the first mount
    pub fn harden_mount_propagation(self) -> Result<Sandbox<MountsPrivate>> {
        crate::kernel::namespace::harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    /// Hostname, loopback, mounts, pivot_root
    pub fn assemble_root(
        self,
        plan: &MountPlan,
        config: &ExecutionConfig,
    ) -> Result<Sandbox<RootReady>> {
        set_sandbox_hostname()?;
        if config.namespaces.isolate_network {
            bring_up_loopback()?;
        }

        let assembler = MountAssembler::new(
            plan,
            config.namespaces.user.creates_user_namespace(),
            config.namespaces.isolate_network,
        )?;
        assembler.assemble(plan, &config.cwd)?;

        log::debug!("[{}] sandbox root ready", self.run_id);
        Ok(self.advance())
    }
}

impl Sandbox<RootReady> {
    /// dup2 host-opened descriptors onto 0, 1 and 2
    pub fn redirect_stdio(self, stdio: &StdioFds) -> Result<Sandbox<StdioReady>> {
        for (fd, target, name) in [
            (stdio.stdin, libc::STDIN_FILENO, "stdin"),
            (stdio.stdout, libc::STDOUT_FILENO, "stdout"),
            (stdio.stderr, libc::STDERR_FILENO, "stderr"),
        ] {
            if let Some(fd) = fd {
                dup2(fd, target)
                    .map_err(|e| RunnerError::Process(format!("dup2({}) failed: {}", name, e)))?;
            }
        }
        Ok(self.advance())
    }
}

impl Sandbox<StdioReady> {
    /// rlimits, umask, FD closure, environment and cwd.
    /// `keep_fds` survive the closure (the exec error pipe).
    pub fn apply_limits(
        self,
        config: &ExecutionConfig,
        keep_fds: &[RawFd],
    ) -> Result<Sandbox<LimitsApplied>> {
        apply_rlimits(&with_default_rlimits(&config.limits.rlimits))?;

        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(PAYLOAD_UMASK));

        crate::utils::fd_closure::close_inherited_fds(keep_fds)?;

        apply_exec_environment(&[("PATH", payload_path(&config.paths))])?;

        std::env::set_current_dir(&config.cwd).map_err(|e| {
            RunnerError::Process(format!(
                "Failed to chdir to {}: {}",
                config.cwd.display(),
                e
            ))
        })?;

        Ok(self.advance())
    }
}

impl Sandbox<LimitsApplied> {
    /// setgroups([]), setresgid then setresuid. Without an identity the
    /// payload keeps the sandbox root.
    pub fn drop_credentials(self, identity: Option<Identity>) -> Result<Sandbox<CredsDropped>> {
        match identity {
            Some(identity) => {
                transition_to_unprivileged(identity)?;
                log::debug!("After transition: {}", current_ids());
            }
            None => log::debug!("No payload identity configured, keeping sandbox root"),
        }
        Ok(self.advance())
    }
}

impl Sandbox<CredsDropped> {
    /// Capabilities + no_new_privs
    pub fn lock_privileges(self) -> Result<Sandbox<PrivsLocked>> {
        drop_all_capabilities()?;
        set_no_new_privs()?;

        if !check_no_new_privs()? {
            return Err(RunnerError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }

        Ok(self.advance())
    }
}

impl Sandbox<PrivsLocked> {
    pub fn ready_for_exec(self) -> Sandbox<ExecReady> {
        self.advance()
    }
}

impl Sandbox<ExecReady> {
    /// Execute the payload. Only returns on failure.
    pub fn exec_payload(self, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(RunnerError::config("command", "empty command"));
        }

        let mut cargv = Vec::with_capacity(command.len());
        for arg in command {
            let c = CString::new(arg.as_str())
                .map_err(|_| RunnerError::config("command", "contains a NUL byte"))?;
            cargv.push(c);
        }
        let cargv_ref: Vec<&std::ffi::CStr> = cargv.iter().map(|c| c.as_c_str()).collect();

        nix::unistd::execvp(cargv[0].as_c_str(), &cargv_ref).map_err(|e| {
            RunnerError::Process(format!("execvp {} failed: {}", command[0], e))
        })?;
        Ok(())
    }
}
