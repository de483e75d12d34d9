/// Namespace isolation for the sandbox init process
/// Clone flag selection, the privilege gate, user namespace id maps and the
/// in-namespace setup of hostname, loopback and mount propagation.
use crate::config::policy::userns::{
    check_unprivileged_userns_support, render_id_map, NamespaceConfig, UserNamespacePolicy,
};
use crate::config::types::{ExecutionConfig, IdMapping, Result, RunnerError};
use crate::kernel::cgroup::backend::{detect_cgroup_backend, CgroupBackendType, CGROUP_ROOT};

use nix::sched::CloneFlags;
use nix::unistd::{sethostname, Pid};
use std::path::Path;
use std::process::Command;

pub const SANDBOX_HOSTNAME: &str = "runbox";
const ID_MAP_HELPER_DIRS: [&str; 3] = ["/usr/bin", "/bin", "/usr/local/bin"];

/// Namespace isolation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIsolation {
    /// Enable network namespace isolation
    enable_network_namespace: bool,
    /// Enable user namespace isolation
    enable_user_namespace: bool,
}

impl NamespaceIsolation {
    pub fn from_config(config: &NamespaceConfig) -> Self {
        Self {
            enable_network_namespace: config.isolate_network,
            enable_user_namespace: config.user.creates_user_namespace(),
        }
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    /// Flags for the clone() that creates the sandbox init process.
    /// Mount, PID, UTS and IPC namespaces are unconditional.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    pub fn network_isolated(&self) -> bool {
        self.enable_network_namespace
    }

    /// Get enabled namespaces as a string
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = vec!["Mount", "PID", "UTS", "IPC"];
        if self.enable_network_namespace {
            namespaces.push("Network");
        }
        if self.enable_user_namespace {
            namespaces.push("User");
        }
        namespaces
    }
}

/// What the host lets this runner do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationCapabilities {
    pub effective_root: bool,
    pub unprivileged_userns: bool,
    pub id_map_helpers: bool,
    pub cgroup_backend: Option<CgroupBackendType>,
}

/// Probe the host once, before any sandbox resource exists
pub fn probe_capabilities() -> IsolationCapabilities {
    let caps = IsolationCapabilities {
        effective_root: nix::unistd::geteuid().is_root(),
        unprivileged_userns: check_unprivileged_userns_support(),
        id_map_helpers: find_helper("newuidmap").is_some() && find_helper("newgidmap").is_some(),
        cgroup_backend: detect_cgroup_backend(Path::new(CGROUP_ROOT)),
    };
    log::debug!("Isolation capabilities: {:?}", caps);
    caps
}

/// Decide whether `config` can run on a host with `caps`.
pub fn check_isolation_capability(
    config: &ExecutionConfig,
    caps: &IsolationCapabilities,
) -> Result<()> {
    if !NamespaceIsolation::is_supported() {
        return Err(RunnerError::Namespace(
            "Kernel does not expose namespaces under /proc/self/ns".to_string(),
        ));
    }

    let policy = &config.namespaces.user;
    if !caps.effective_root {
        match policy {
            UserNamespacePolicy::Disabled => {
                return Err(RunnerError::Privilege(
                    "Namespace isolation without a user namespace requires root; \
                     enable `user_namespace` to run unprivileged"
                        .to_string(),
                ))
            }
            _ if !caps.unprivileged_userns => {
                return Err(RunnerError::Privilege(
                    "Unprivileged user namespaces are disabled on this host".to_string(),
                ))
            }
            UserNamespacePolicy::Mapped { uid, gid } if !caps.id_map_helpers => {
                if uid.range_count > 0 || gid.range_count > 0 {
                    return Err(RunnerError::Privilege(
                        "Mapping a subordinate id range requires newuidmap/newgidmap".to_string(),
                    ));
                }
            }
            _ => {}
        }
    }

    if caps.cgroup_backend.is_none() && !config.limits.cgroup.is_empty() {
        return Err(RunnerError::Cgroup(
            "cgroup limits were requested but no cgroup hierarchy is available".to_string(),
        ));
    }

    Ok(())
}

fn find_helper(name: &str) -> Option<std::path::PathBuf> {
    ID_MAP_HELPER_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| path.exists())
}

/// Arguments for newuidmap/newgidmap: `<pid> 0 <root> 1 [1 <begin> <count>]`
pub fn id_map_helper_args(pid: Pid, mapping: &IdMapping) -> Vec<String> {
    let mut args = vec![
        pid.to_string(),
        "0".to_string(),
        mapping.root_id.to_string(),
        "1".to_string(),
    ];
    if mapping.range_count > 0 {
        args.push("1".to_string());
        args.push(mapping.range_begin.to_string());
        args.push(mapping.range_count.to_string());
    }
    args
}

/// Write uid/gid maps of the freshly cloned init process `pid`.
pub fn write_id_maps(pid: Pid, policy: &UserNamespacePolicy) -> Result<()> {
    match policy {
        UserNamespacePolicy::Disabled => Ok(()),
        UserNamespacePolicy::Transparent => {
            let euid = nix::unistd::geteuid();
            let egid = nix::unistd::getegid();
            write_proc_file(pid, "setgroups", "deny")?;
            write_proc_file(pid, "uid_map", &format!("0 {} 1\n", euid))?;
            write_proc_file(pid, "gid_map", &format!("0 {} 1\n", egid))?;
            log::debug!("Mapped sandbox root to {}:{}", euid, egid);
            Ok(())
        }
        UserNamespacePolicy::Mapped { uid, gid } => {
            if nix::unistd::geteuid().is_root() {
                write_proc_file(pid, "uid_map", &render_id_map(uid))?;
                write_proc_file(pid, "gid_map", &render_id_map(gid))?;
            } else {
                run_id_map_helper("newuidmap", pid, uid)?;
                run_id_map_helper("newgidmap", pid, gid)?;
            }
            log::debug!("Wrote id maps uid={:?} gid={:?}", uid, gid);
            Ok(())
        }
    }
}

fn write_proc_file(pid: Pid, file: &str, content: &str) -> Result<()> {
    let path = format!("/proc/{}/{}", pid, file);
    std::fs::write(&path, content)
        .map_err(|e| RunnerError::Namespace(format!("Failed to write {}: {}", path, e)))
}

fn run_id_map_helper(helper: &str, pid: Pid, mapping: &IdMapping) -> Result<()> {
    let program = find_helper(helper)
        .ok_or_else(|| RunnerError::Namespace(format!("{} not found", helper)))?;
    let output = Command::new(&program)
        .args(id_map_helper_args(pid, mapping))
        .output()
        .map_err(|e| RunnerError::Namespace(format!("Failed to run {}: {}", helper, e)))?;

    if !output.status.success() {
        return Err(RunnerError::Namespace(format!(
            "{} failed ({}): {}",
            helper,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Set the hostname inside the new UTS namespace
pub fn set_sandbox_hostname() -> Result<()> {
    sethostname(SANDBOX_HOSTNAME)
        .map_err(|e| RunnerError::Namespace(format!("Failed to set hostname: {}", e)))
}

/// Bring up `lo` inside the new network namespace
pub fn bring_up_loopback() -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(RunnerError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    let get_flags_rc = unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if get_flags_rc != 0 {
        let err = std::io::Error::last_os_error();
        let _ = unsafe { libc::close(sock) };
        return Err(RunnerError::Namespace(format!(
            "Failed to query loopback flags: {}",
            err
        )));
    }

    let current_flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
    ifr.ifr_ifru.ifru_flags = (current_flags | libc::IFF_UP) as libc::c_short;

    let set_flags_rc = unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr) };
    let set_err = std::io::Error::last_os_error();
    let _ = unsafe { libc::close(sock) };

    if set_flags_rc != 0 {
        return Err(RunnerError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            set_err
        )));
    }

    log::debug!("Enabled loopback interface inside network namespace");
    Ok(())
}

/// New cgroup namespace for the calling process.
/// Unshared by init after the supervisor attached it, so the namespace is
/// rooted at the run cgroup and the payload cannot see the host hierarchy.
pub fn enter_cgroup_namespace() -> Result<()> {
    nix::sched::unshare(CloneFlags::CLONE_NEWCGROUP)
        .map_err(|e| RunnerError::Namespace(format!("Failed to unshare cgroup namespace: {}", e)))?;
    log::debug!("Entered cgroup namespace");
    Ok(())
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
/// Must succeed before any mount is made, otherwise mounts could
/// propagate back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        RunnerError::Namespace(format!(
            "Failed to make / private (MS_PRIVATE|MS_REC): {}",
            e
        ))
    })?;

    log::debug!("Mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Limits, RootfsSource, StdioConfig};

    fn config_with(policy: UserNamespacePolicy) -> ExecutionConfig {
        ExecutionConfig {
            rootfs: RootfsSource::Directory("/srv/root".into()),
            cwd: "/".into(),
            command: vec!["true".to_string()],
            paths: Vec::new(),
            mounts: Vec::new(),
            limits: Limits::default(),
            namespaces: NamespaceConfig {
                user: policy,
                isolate_network: true,
            },
            stdio: StdioConfig::default(),
            user: None,
            cgroup_parent: None,
        }
    }

    fn caps(root: bool, userns: bool) -> IsolationCapabilities {
        IsolationCapabilities {
            effective_root: root,
            unprivileged_userns: userns,
            id_map_helpers: false,
            cgroup_backend: Some(CgroupBackendType::V2),
        }
    }

    #[test]
    fn clone_flags_follow_config() {
        let isolated = NamespaceIsolation::from_config(&NamespaceConfig::default());
        let flags = isolated.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));

        let rootless = NamespaceIsolation::from_config(&NamespaceConfig {
            user: UserNamespacePolicy::Transparent,
            isolate_network: false,
        });
        let flags = rootless.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert_eq!(rootless.enabled_namespaces(), vec!["Mount", "PID", "UTS", "IPC", "User"]);
    }

    #[test]
    fn unprivileged_run_without_user_namespace_is_refused() {
        let config = config_with(UserNamespacePolicy::Disabled);
        let err = check_isolation_capability(&config, &caps(false, true)).unwrap_err();
        assert!(matches!(err, RunnerError::Privilege(_)));
    }

    #[test]
    fn unprivileged_run_needs_userns_support() {
        let config = config_with(UserNamespacePolicy::Transparent);
        assert!(check_isolation_capability(&config, &caps(false, false)).is_err());
        assert!(check_isolation_capability(&config, &caps(false, true)).is_ok());
    }

    #[test]
    fn mapped_range_needs_helpers_when_unprivileged() {
        let mapping = IdMapping {
            root_id: 1000,
            range_begin: 100000,
            range_count: 65536,
        };
        let config = config_with(UserNamespacePolicy::Mapped {
            uid: mapping,
            gid: mapping,
        });
        assert!(check_isolation_capability(&config, &caps(false, true)).is_err());

        let mut with_helpers = caps(false, true);
        with_helpers.id_map_helpers = true;
        assert!(check_isolation_capability(&config, &with_helpers).is_ok());
        assert!(check_isolation_capability(&config, &caps(true, false)).is_ok());
    }

    #[test]
    fn cgroup_limits_need_a_hierarchy() {
        let mut config = config_with(UserNamespacePolicy::Disabled);
        config.limits.cgroup.memory = Some(64 << 20);
        let mut no_cgroup = caps(true, true);
        no_cgroup.cgroup_backend = None;

        let err = check_isolation_capability(&config, &no_cgroup).unwrap_err();
        assert!(matches!(err, RunnerError::Cgroup(_)));
        assert!(check_isolation_capability(&config, &caps(true, true)).is_ok());
    }

    #[test]
    fn helper_args_list_root_then_range() {
        let mapping = IdMapping {
            root_id: 1000,
            range_begin: 100000,
            range_count: 65536,
        };
        assert_eq!(
            id_map_helper_args(Pid::from_raw(42), &mapping),
            vec!["42", "0", "1000", "1", "1", "100000", "65536"]
        );

        let root_only = IdMapping {
            range_count: 0,
            ..mapping
        };
        assert_eq!(id_map_helper_args(Pid::from_raw(42), &root_only), vec!["42", "0", "1000", "1"]);
    }
}
