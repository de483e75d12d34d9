//! Cgroup backend abstraction for v1/v2 dual support.
//!
//! A backend instance is bound to exactly one run cgroup, so every accessor
//! reads that run's counters.

use crate::config::types::{CgroupEvidence, CgroupLimits, Result, RunnerError};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_PARENT: &str = "runbox";

/// CPU time charged to the cgroup, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuUsage {
    pub user_usec: u64,
    pub system_usec: u64,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;
    /// Directory of the run cgroup (the memory hierarchy for v1)
    fn path(&self) -> &Path;
    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()>;
    fn attach_process(&self, pid: u32) -> Result<()>;
    fn cpu_usage(&self) -> Result<CpuUsage>;
    /// Number of forks refused because `pids.max` was reached
    fn pids_limit_hits(&self) -> Result<u64>;
    fn collect_evidence(&self) -> Result<CgroupEvidence>;
    fn remove(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupBackendType {
    V1,
    V2,
}

/// Detect available cgroup backend under `root`: v2 preferred, v1 fallback.
pub fn detect_cgroup_backend(root: &Path) -> Option<CgroupBackendType> {
    if root.join("cgroup.controllers").exists() {
        return Some(CgroupBackendType::V2);
    }
    if root.join("memory").exists() && root.join("pids").exists() {
        return Some(CgroupBackendType::V1);
    }
    None
}

pub fn backend_type_name(backend_type: CgroupBackendType) -> &'static str {
    match backend_type {
        CgroupBackendType::V1 => "cgroup_v1",
        CgroupBackendType::V2 => "cgroup_v2",
    }
}

/// Create the run cgroup `<parent>/<run_id>` with the detected backend.
///
/// `parent` is relative to the cgroup root for v2 and to each controller
/// hierarchy for v1; an absolute v2 path is used as is.
pub fn create_cgroup_backend(parent: Option<&Path>, run_id: &str) -> Result<Box<dyn CgroupBackend>> {
    let root = Path::new(CGROUP_ROOT);
    let parent = parent.unwrap_or_else(|| Path::new(DEFAULT_PARENT));
    let detected = detect_cgroup_backend(root);
    log::debug!("Cgroup backend selection: detected={:?}", detected);

    match detected {
        Some(CgroupBackendType::V2) => {
            let parent_dir = if parent.starts_with(root) {
                parent.to_path_buf()
            } else {
                root.join(parent.strip_prefix("/").unwrap_or(parent))
            };
            Ok(Box::new(crate::kernel::cgroup::v2::CgroupV2::create(
                &parent_dir,
                run_id,
            )?))
        }
        Some(CgroupBackendType::V1) => {
            let relative = parent.strip_prefix("/").unwrap_or(parent).join(run_id);
            Ok(Box::new(crate::kernel::cgroup::v1::CgroupV1::create(
                root, &relative,
            )?))
        }
        None => Err(RunnerError::Cgroup(format!(
            "No cgroup hierarchy found under {}",
            root.display()
        ))),
    }
}

/// Owns a run cgroup and removes it when dropped.
pub struct CgroupLease {
    backend: Box<dyn CgroupBackend>,
    released: AtomicBool,
}

impl CgroupLease {
    pub fn new(backend: Box<dyn CgroupBackend>) -> Self {
        Self {
            backend,
            released: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &dyn CgroupBackend {
        self.backend.as_ref()
    }

    /// Remove the cgroup now; later calls and the drop are no-ops
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.remove()
    }
}

impl Drop for CgroupLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!(
                "Failed to remove cgroup {}: {}",
                self.backend.path().display(),
                e
            );
        }
    }
}

/// Remove an empty cgroup directory, retrying while the kernel still reports it busy.
pub(crate) fn remove_cgroup_dir(path: &Path) -> Result<()> {
    const ATTEMPTS: u32 = 50;

    for attempt in 0..ATTEMPTS {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt + 1 < ATTEMPTS => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(RunnerError::Cgroup(format!(
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}

pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    fs::write(&path, value).map_err(|e| {
        RunnerError::Cgroup(format!("Failed to write {:?} to {}: {}", value, path.display(), e))
    })
}

/// Read a single-value control file; `max` reads as `None`
pub(crate) fn read_u64(path: &Path) -> Result<Option<u64>> {
    let content = fs::read_to_string(path)
        .map_err(|e| RunnerError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))?;
    let value = content.trim();
    if value == "max" {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|e| RunnerError::Cgroup(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Look up `key` in a flat keyed file such as `memory.events` or `cpu.stat`
pub(crate) fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
            _ => None,
        }
    })
}

pub(crate) fn read_keyed(path: &Path, key: &str) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| parse_keyed(&content, key))
}
