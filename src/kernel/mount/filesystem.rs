/// Sandbox root assembly
/// Runs inside the fresh mount namespace, after propagation was made private.
use crate::config::types::{Mount, OverlayLayers, Result, RootfsSource, RunnerError};
use crate::kernel::mount::plan::{host_path, MountPlan, MountStep};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

const DEVICE_NODES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];
const DEVICE_LINKS: [(&str, &str); 5] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];
/// Host kernel state hidden from the payload: files behind /dev/null,
/// directories behind an empty read-only tmpfs
const MASKED_PROC_PATHS: [&str; 9] = [
    "acpi",
    "asound",
    "kcore",
    "keys",
    "latency_stats",
    "timer_list",
    "timer_stats",
    "sched_debug",
    "scsi",
];
/// Kept visible but read-only
const READONLY_PROC_PATHS: [&str; 5] = ["bus", "fs", "irq", "sys", "sysrq-trigger"];

fn cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|e| RunnerError::Mount(format!("Invalid {}: {}", what, e)))
}

fn path_cstring(path: &Path) -> Result<CString> {
    cstring(&path.to_string_lossy(), "path")
}

/// mount(2) with the usual CString plumbing
fn mount_raw(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> Result<()> {
    let source_c = source.map(path_cstring).transpose()?;
    let target_c = path_cstring(target)?;
    let fstype_c = fstype.map(|f| cstring(f, "fstype")).transpose()?;
    let data_c = data.map(|d| cstring(d, "mount data")).transpose()?;

    let rc = unsafe {
        libc::mount(
            source_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |f| f.as_ptr()),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |d| d.as_ptr() as *const libc::c_void),
        )
    };

    if rc != 0 {
        return Err(RunnerError::Mount(format!(
            "mount {} on {} ({}) failed: {}",
            source.map_or_else(|| "none".to_string(), |s| s.display().to_string()),
            target.display(),
            fstype.unwrap_or("bind"),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Flags of the mount containing `path` that a remount has to keep.
/// Inside a user namespace the kernel refuses to clear them.
fn locked_flags(path: &Path) -> Result<libc::c_ulong> {
    let path_c = path_cstring(path)?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path_c.as_ptr(), &mut stat) } != 0 {
        return Err(RunnerError::Mount(format!(
            "statvfs {} failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    let pairs = [
        (libc::ST_RDONLY, libc::MS_RDONLY),
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    Ok(pairs
        .iter()
        .filter(|(st, _)| stat.f_flag & (*st as libc::c_ulong) != 0)
        .fold(0, |acc, (_, ms)| acc | ms))
}

/// Overlay mount data; `userxattr` lets an unprivileged user namespace own it
pub fn overlay_options(layers: &OverlayLayers, in_user_namespace: bool) -> Result<String> {
    let mut parts = Vec::with_capacity(4);
    for (key, dir) in [
        ("lowerdir", &layers.lower_dir),
        ("upperdir", &layers.upper_dir),
        ("workdir", &layers.work_dir),
    ] {
        let value = dir.to_string_lossy();
        if value.contains(',') || value.contains(':') {
            return Err(RunnerError::Mount(format!(
                "overlay {} {} contains ',' or ':'",
                key, value
            )));
        }
        parts.push(format!("{}={}", key, value));
    }
    if in_user_namespace {
        parts.push("userxattr".to_string());
    }
    Ok(parts.join(","))
}

/// Remount flags for a bind with the requested access
pub fn bind_remount_flags(mount: &Mount) -> libc::c_ulong {
    let mut flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_NOSUID | libc::MS_NODEV;
    if !mount.options.read_write {
        flags |= libc::MS_RDONLY;
    }
    if !mount.options.executable {
        flags |= libc::MS_NOEXEC;
    }
    flags
}

/// Canonical `target` must stay under canonical `root`
pub fn ensure_contained(root: &Path, target: &Path) -> Result<()> {
    let canonical_root = root.canonicalize().map_err(|e| {
        RunnerError::Mount(format!("Failed to canonicalize {}: {}", root.display(), e))
    })?;
    let canonical_target = target.canonicalize().map_err(|e| {
        RunnerError::Mount(format!("Failed to canonicalize {}: {}", target.display(), e))
    })?;

    if !canonical_target.starts_with(&canonical_root) {
        return Err(RunnerError::Mount(format!(
            "Mount destination {} resolves outside the sandbox root ({})",
            target.display(),
            canonical_target.display()
        )));
    }
    Ok(())
}

/// Like [`ensure_contained`] for a path that may not exist yet: its deepest
/// existing ancestor must resolve under `root`. A dangling symlink on the
/// way fails to canonicalize and is refused too.
pub fn ensure_creatable_within(root: &Path, target: &Path) -> Result<()> {
    let existing = target
        .ancestors()
        .find(|path| fs::symlink_metadata(path).is_ok())
        .unwrap_or(root);
    ensure_contained(root, existing)
}

/// Create `target` as an empty file or a directory, whichever matches `source`
fn create_mount_point(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        return fs::create_dir_all(target).map_err(|e| {
            RunnerError::Mount(format!("Failed to create {}: {}", target.display(), e))
        });
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            RunnerError::Mount(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    if !target.exists() {
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .map_err(|e| {
                RunnerError::Mount(format!("Failed to create {}: {}", target.display(), e))
            })?;
    }
    Ok(())
}

/// Hide `target`: /dev/null over a file, an empty read-only tmpfs over a directory
fn mask_path(target: &Path) -> Result<()> {
    if target.is_dir() {
        mount_raw(
            Some(Path::new("tmpfs")),
            target,
            Some("tmpfs"),
            libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None,
        )
    } else {
        mount_raw(Some(Path::new("/dev/null")), target, None, libc::MS_BIND, None)
    }
}

/// Builds the sandbox root from a [`MountPlan`] and pivots into it
#[derive(Clone, Debug)]
pub struct MountAssembler {
    root: PathBuf,
    in_user_namespace: bool,
    network_isolated: bool,
}

impl MountAssembler {
    pub fn new(plan: &MountPlan, in_user_namespace: bool, network_isolated: bool) -> Result<Self> {
        let root = plan
            .root()
            .map(|rootfs| rootfs.root_dir().clone())
            .ok_or_else(|| RunnerError::Mount("Mount plan has no root step".to_string()))?;
        Ok(Self {
            root,
            in_user_namespace,
            network_isolated,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Assemble every step, add system mounts and pivot into the new root.
    /// On return the process sees the sandbox as `/` with cwd `/`.
    pub fn assemble(&self, plan: &MountPlan, cwd: &Path) -> Result<()> {
        let mut plain_root = false;
        for step in plan.steps() {
            match step {
                MountStep::Root(rootfs) => {
                    plain_root = matches!(rootfs, RootfsSource::Directory(_));
                    self.mount_root(rootfs)?;
                }
                MountStep::Bind(mount) => self.bind(mount)?,
            }
        }

        self.mount_proc()?;
        self.mount_dev()?;
        self.mount_sys();

        let cwd_host = host_path(&self.root, cwd);
        ensure_creatable_within(&self.root, &cwd_host)?;
        if !cwd_host.exists() {
            fs::create_dir_all(&cwd_host).map_err(|e| {
                RunnerError::Mount(format!("Failed to create cwd {}: {}", cwd.display(), e))
            })?;
        }

        if plain_root {
            let flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID;
            mount_raw(None, &self.root, None, flags | locked_flags(&self.root)?, None)?;
            log::debug!("Remounted {} read-only", self.root.display());
        }

        self.pivot()
    }

    fn mount_root(&self, rootfs: &RootfsSource) -> Result<()> {
        match rootfs {
            RootfsSource::Directory(dir) => {
                mount_raw(Some(dir), dir, None, libc::MS_BIND | libc::MS_REC, None)?;
                log::debug!("Bound plain root {}", dir.display());
            }
            RootfsSource::Overlay(layers) => {
                fs::create_dir_all(&layers.merged_dir).map_err(|e| {
                    RunnerError::Mount(format!(
                        "Failed to create {}: {}",
                        layers.merged_dir.display(),
                        e
                    ))
                })?;
                let options = overlay_options(layers, self.in_user_namespace)?;
                mount_raw(
                    Some(Path::new("overlay")),
                    &layers.merged_dir,
                    Some("overlay"),
                    0,
                    Some(&options),
                )?;
                log::debug!("Mounted overlay root at {} ({})", layers.merged_dir.display(), options);
            }
        }
        Ok(())
    }

    fn bind(&self, mount: &Mount) -> Result<()> {
        if !mount.source.exists() {
            return Err(RunnerError::Mount(format!(
                "Mount source {} does not exist",
                mount.source.display()
            )));
        }

        let target = host_path(&self.root, &mount.destination);
        ensure_creatable_within(&self.root, &target)?;
        create_mount_point(&mount.source, &target)?;
        ensure_contained(&self.root, &target)?;

        let mut flags = libc::MS_BIND;
        if mount.source.is_dir() {
            flags |= libc::MS_REC;
        }
        mount_raw(Some(&mount.source), &target, None, flags, None)?;

        let remount = bind_remount_flags(mount) | locked_flags(&target)?;
        mount_raw(None, &target, None, remount, None)?;

        log::debug!(
            "Bound {} -> {} (rw={}, exec={})",
            mount.source.display(),
            mount.destination.display(),
            mount.options.read_write,
            mount.options.executable
        );
        Ok(())
    }

    fn system_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        ensure_creatable_within(&self.root, &dir)?;
        fs::create_dir_all(&dir)
            .map_err(|e| RunnerError::Mount(format!("Failed to create {}: {}", dir.display(), e)))?;
        ensure_contained(&self.root, &dir)?;
        Ok(dir)
    }

    fn mount_proc(&self) -> Result<()> {
        let proc_dir = self.system_dir("proc")?;
        mount_raw(
            Some(Path::new("proc")),
            &proc_dir,
            Some("proc"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None,
        )?;

        for name in MASKED_PROC_PATHS {
            let target = proc_dir.join(name);
            if target.exists() {
                if let Err(e) = mask_path(&target) {
                    log::warn!("Could not mask /proc/{}: {}", name, e);
                }
            }
        }
        for name in READONLY_PROC_PATHS {
            let target = proc_dir.join(name);
            if !target.exists() {
                continue;
            }
            let result = mount_raw(Some(&target), &target, None, libc::MS_BIND | libc::MS_REC, None)
                .and_then(|_| {
                    let flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY;
                    mount_raw(None, &target, None, flags | locked_flags(&target)?, None)
                });
            if let Err(e) = result {
                log::warn!("Could not make /proc/{} read-only: {}", name, e);
            }
        }

        log::debug!("Mounted /proc");
        Ok(())
    }

    fn mount_dev(&self) -> Result<()> {
        let dev_dir = self.system_dir("dev")?;
        mount_raw(
            Some(Path::new("tmpfs")),
            &dev_dir,
            Some("tmpfs"),
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_STRICTATIME,
            Some("mode=755,size=65536k"),
        )?;

        for name in DEVICE_NODES {
            let host = Path::new("/dev").join(name);
            if !host.exists() {
                log::warn!("Host device {} missing, not exposed", host.display());
                continue;
            }
            let target = dev_dir.join(name);
            create_mount_point(&host, &target)?;
            mount_raw(Some(&host), &target, None, libc::MS_BIND, None)?;
        }

        for (name, link) in DEVICE_LINKS {
            std::os::unix::fs::symlink(link, dev_dir.join(name)).map_err(|e| {
                RunnerError::Mount(format!("Failed to create /dev/{}: {}", name, e))
            })?;
        }

        let pts = dev_dir.join("pts");
        fs::create_dir_all(&pts)?;
        if let Err(e) = mount_raw(
            Some(Path::new("devpts")),
            &pts,
            Some("devpts"),
            libc::MS_NOSUID | libc::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=620"),
        ) {
            log::warn!("Could not mount /dev/pts: {}", e);
        }

        let mqueue = dev_dir.join("mqueue");
        fs::create_dir_all(&mqueue)?;
        if let Err(e) = mount_raw(
            Some(Path::new("mqueue")),
            &mqueue,
            Some("mqueue"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None,
        ) {
            log::warn!("Could not mount /dev/mqueue: {}", e);
        }

        let shm = dev_dir.join("shm");
        fs::create_dir_all(&shm)?;
        mount_raw(
            Some(Path::new("shm")),
            &shm,
            Some("tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            Some("mode=1777,size=65536k"),
        )?;

        log::debug!("Mounted /dev with {} device nodes", DEVICE_NODES.len());
        Ok(())
    }

    /// sysfs can only be mounted by the owner of the network namespace
    fn mount_sys(&self) {
        let sys_dir = self.root.join("sys");
        if !sys_dir.is_dir() {
            return;
        }
        if !self.network_isolated && self.in_user_namespace {
            log::debug!("Skipping /sys: network namespace is shared with the host");
            return;
        }
        match mount_raw(
            Some(Path::new("sysfs")),
            &sys_dir,
            Some("sysfs"),
            libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None,
        ) {
            Ok(()) => log::debug!("Mounted read-only /sys"),
            Err(e) => {
                log::warn!("Could not mount /sys: {}", e);
                return;
            }
        }

        let firmware = sys_dir.join("firmware");
        if firmware.exists() {
            if let Err(e) = mask_path(&firmware) {
                log::warn!("Could not mask /sys/firmware: {}", e);
            }
        }
    }

    /// pivot_root(".", ".") then lazily detach the old root stacked below
    fn pivot(&self) -> Result<()> {
        std::env::set_current_dir(&self.root).map_err(|e| {
            RunnerError::Mount(format!("Failed to enter {}: {}", self.root.display(), e))
        })?;

        let dot = cstring(".", "path")?;
        let rc = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
        if rc != 0 {
            return Err(RunnerError::Mount(format!(
                "pivot_root into {} failed: {}",
                self.root.display(),
                std::io::Error::last_os_error()
            )));
        }

        if unsafe { libc::umount2(dot.as_ptr(), libc::MNT_DETACH) } != 0 {
            return Err(RunnerError::Mount(format!(
                "Failed to detach old root: {}",
                std::io::Error::last_os_error()
            )));
        }

        std::env::set_current_dir("/")
            .map_err(|e| RunnerError::Mount(format!("Failed to chdir to new root: {}", e)))?;
        log::debug!("Pivoted into {}", self.root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::MountOptions;

    fn layers() -> OverlayLayers {
        OverlayLayers {
            lower_dir: "/srv/lower".into(),
            upper_dir: "/srv/upper".into(),
            work_dir: "/srv/work".into(),
            merged_dir: "/srv/merged".into(),
        }
    }

    #[test]
    fn overlay_options_carry_userxattr_in_user_namespace() {
        assert_eq!(
            overlay_options(&layers(), false).unwrap(),
            "lowerdir=/srv/lower,upperdir=/srv/upper,workdir=/srv/work"
        );
        assert!(overlay_options(&layers(), true).unwrap().ends_with(",userxattr"));
    }

    #[test]
    fn overlay_options_reject_separators() {
        let mut bad = layers();
        bad.lower_dir = "/srv/a:b".into();
        assert!(overlay_options(&bad, false).is_err());
    }

    #[test]
    fn bind_flags_follow_options() {
        let mut mount = Mount {
            source: "/data".into(),
            destination: "/data".into(),
            options: MountOptions::default(),
        };
        let flags = bind_remount_flags(&mount);
        assert_ne!(flags & libc::MS_RDONLY, 0);
        assert_ne!(flags & libc::MS_NOEXEC, 0);
        assert_ne!(flags & libc::MS_NOSUID, 0);

        mount.options.read_write = true;
        mount.options.executable = true;
        let flags = bind_remount_flags(&mount);
        assert_eq!(flags & libc::MS_RDONLY, 0);
        assert_eq!(flags & libc::MS_NOEXEC, 0);
        assert_ne!(flags & libc::MS_NODEV, 0);
    }

    #[test]
    fn symlinked_destination_outside_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();

        assert!(ensure_contained(root.path(), &root.path().join("escape")).is_err());

        fs::create_dir(root.path().join("inside")).unwrap();
        assert!(ensure_contained(root.path(), &root.path().join("inside")).is_ok());
    }

    #[test]
    fn escaping_destination_is_refused_before_anything_is_created() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();

        let target = root.path().join("escape/planted/dir");
        assert!(ensure_creatable_within(root.path(), &target).is_err());
        assert!(!outside.path().join("planted").exists());

        std::os::unix::fs::symlink("/nonexistent-runbox-target", root.path().join("dangling")).unwrap();
        assert!(ensure_creatable_within(root.path(), &root.path().join("dangling/x")).is_err());

        assert!(ensure_creatable_within(root.path(), &root.path().join("usr/local/bin")).is_ok());
    }

    #[test]
    fn mount_points_match_source_kind() {
        let scratch = tempfile::tempdir().unwrap();
        let file_source = scratch.path().join("input.txt");
        fs::write(&file_source, "data").unwrap();

        let file_target = scratch.path().join("root/a/b/input.txt");
        create_mount_point(&file_source, &file_target).unwrap();
        assert!(file_target.is_file());

        let dir_target = scratch.path().join("root/lib");
        create_mount_point(scratch.path(), &dir_target).unwrap();
        assert!(dir_target.is_dir());
    }

    #[test]
    fn locked_flags_reads_the_containing_mount() {
        let flags = locked_flags(Path::new("/proc")).unwrap();
        assert_ne!(flags & libc::MS_NOSUID, 0);
    }
}
