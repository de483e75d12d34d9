/// Cgroup v2 backend implementation
/// OOM kills are reported from memory.events, peak usage from memory.peak,
/// and memory.oom.group=1 makes an OOM take down the whole run.
use crate::config::types::{CgroupEvidence, CgroupLimits, Result, RunnerError, CPU_PERIOD_USEC};
use crate::kernel::cgroup::backend::{
    parse_keyed, read_keyed, read_u64, remove_cgroup_dir, write_control, CgroupBackend, CpuUsage,
};
use std::fs;
use std::path::{Path, PathBuf};

const CONTROLLERS: [&str; 4] = ["memory", "pids", "cpu", "cpuset"];

/// Cgroup v2 backend bound to one run cgroup
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    /// Create `<parent>/<run_id>` and delegate the controllers it needs
    pub fn create(parent: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(parent).map_err(|e| {
            RunnerError::Cgroup(format!(
                "Failed to create parent cgroup {}: {}",
                parent.display(),
                e
            ))
        })?;
        enable_controllers(parent);

        let path = parent.join(run_id);
        fs::create_dir(&path).map_err(|e| {
            RunnerError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        let cgroup = Self { path };
        if cgroup.path.join("memory.oom.group").exists() {
            write_control(&cgroup.path, "memory.oom.group", "1")?;
        }

        log::debug!("Created cgroup v2 {}", cgroup.path.display());
        Ok(cgroup)
    }

    /// Bind to an already existing run cgroup
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    /// Peak of memory (plus swap when accounted), falling back to current usage
    fn memory_peak(&self) -> Option<u64> {
        let peak = read_u64(&self.path.join("memory.peak")).ok().flatten();
        let swap_peak = read_u64(&self.path.join("memory.swap.peak")).ok().flatten();
        match (peak, swap_peak) {
            (Some(memory), Some(swap)) => Some(memory.saturating_add(swap)),
            (Some(memory), None) => Some(memory),
            (None, _) => read_u64(&self.path.join("memory.current")).ok().flatten(),
        }
    }
}

/// `cpu.max` line: quota and period, a negative quota lifts the bound
fn cpu_max(quota: i64) -> String {
    if quota < 0 {
        format!("max {}", CPU_PERIOD_USEC)
    } else {
        format!("{} {}", quota, CPU_PERIOD_USEC)
    }
}

/// Best effort: the parent may already delegate them, or the runner may only
/// own the leaf.
fn enable_controllers(parent: &Path) {
    let control = parent.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&control).unwrap_or_default();
    for controller in CONTROLLERS {
        if enabled.split_whitespace().any(|c| c == controller) {
            continue;
        }
        if let Err(e) = fs::write(&control, format!("+{}", controller)) {
            log::warn!(
                "Could not enable {} controller in {}: {}",
                controller,
                parent.display(),
                e
            );
        }
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v2"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()> {
        if let Some(memory) = limits.memory {
            write_control(&self.path, "memory.max", &memory.to_string())?;
        }

        if let Some(memory_swap) = limits.memory_swap {
            // memory.swap.max bounds swap alone, the config bounds memory+swap
            let swap = memory_swap.saturating_sub(limits.memory.unwrap_or(0));
            if self.path.join("memory.swap.max").exists() {
                write_control(&self.path, "memory.swap.max", &swap.to_string())?;
            } else {
                log::warn!(
                    "Swap accounting unavailable; memory+swap ceiling of {} not enforced",
                    memory_swap
                );
            }
        }

        if let Some(reservation) = limits.memory_reservation {
            write_control(&self.path, "memory.low", &reservation.to_string())?;
        }

        if let Some(pids) = limits.pids {
            write_control(&self.path, "pids.max", &pids.to_string())?;
        }

        if let Some(weight) = limits.cpu_weight() {
            write_control(&self.path, "cpu.weight", &weight.to_string())?;
        }
        if let Some(quota) = limits.cpu_quota {
            write_control(&self.path, "cpu.max", &cpu_max(quota))?;
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            write_control(&self.path, "cpuset.cpus", cpus)?;
        }
        if let Some(mems) = &limits.cpuset_mems {
            write_control(&self.path, "cpuset.mems", mems)?;
        }

        log::debug!("Applied cgroup limits {:?} to {}", limits, self.path.display());
        Ok(())
    }

    fn attach_process(&self, pid: u32) -> Result<()> {
        write_control(&self.path, "cgroup.procs", &pid.to_string())
    }

    fn cpu_usage(&self) -> Result<CpuUsage> {
        let stat = self.path.join("cpu.stat");
        let content = fs::read_to_string(&stat)
            .map_err(|e| RunnerError::Cgroup(format!("Failed to read {}: {}", stat.display(), e)))?;
        Ok(CpuUsage {
            user_usec: parse_keyed(&content, "user_usec").unwrap_or(0),
            system_usec: parse_keyed(&content, "system_usec").unwrap_or(0),
        })
    }

    fn pids_limit_hits(&self) -> Result<u64> {
        Ok(read_keyed(&self.path.join("pids.events"), "max").unwrap_or(0))
    }

    fn collect_evidence(&self) -> Result<CgroupEvidence> {
        let cpu = self.cpu_usage().ok();
        Ok(CgroupEvidence {
            memory_peak: self.memory_peak(),
            memory_limit: read_u64(&self.path.join("memory.max")).ok().flatten(),
            oom_kill_events: read_keyed(&self.path.join("memory.events"), "oom_kill").unwrap_or(0),
            pids_limit_events: self.pids_limit_hits()?,
            cpu_user_usec: cpu.map(|c| c.user_usec),
            cpu_system_usec: cpu.map(|c| c.system_usec),
        })
    }

    fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            let _ = fs::write(&kill, "1");
        }
        remove_cgroup_dir(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, CgroupV2) {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run-1");
        fs::create_dir(&run).unwrap();
        (dir, CgroupV2::open(run))
    }

    #[test]
    fn limits_are_written_to_control_files() {
        let (_dir, cgroup) = scratch();
        fs::write(cgroup.path().join("memory.swap.max"), "max").unwrap();

        cgroup
            .apply_limits(&CgroupLimits {
                memory: Some(32 << 20),
                memory_swap: Some(48 << 20),
                pids: Some(8),
                ..CgroupLimits::default()
            })
            .unwrap();

        let read = |name: &str| fs::read_to_string(cgroup.path().join(name)).unwrap();
        assert_eq!(read("memory.max"), (32u64 << 20).to_string());
        assert_eq!(read("memory.swap.max"), (16u64 << 20).to_string());
        assert_eq!(read("pids.max"), "8");
        assert!(!cgroup.path().join("cpu.max").exists());
    }

    #[test]
    fn cpu_and_cpuset_controls_are_written() {
        let (_dir, cgroup) = scratch();
        cgroup
            .apply_limits(&CgroupLimits {
                memory_reservation: Some(4 << 20),
                cpu_shares: Some(1024),
                cpu_quota: Some(50_000),
                cpuset_cpus: Some("0-1".to_string()),
                cpuset_mems: Some("0".to_string()),
                ..CgroupLimits::default()
            })
            .unwrap();

        let read = |name: &str| fs::read_to_string(cgroup.path().join(name)).unwrap();
        assert_eq!(read("memory.low"), (4u64 << 20).to_string());
        assert_eq!(read("cpu.weight"), "39");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("cpuset.cpus"), "0-1");
        assert_eq!(read("cpuset.mems"), "0");

        assert_eq!(cpu_max(-1), "max 100000");
    }

    #[test]
    fn evidence_reads_counters() {
        let (_dir, cgroup) = scratch();
        let write = |name: &str, content: &str| fs::write(cgroup.path().join(name), content).unwrap();
        write("memory.peak", "1048576\n");
        write("memory.max", "2097152\n");
        write("memory.events", "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\n");
        write("pids.events", "max 3\n");
        write("cpu.stat", "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n");

        let evidence = cgroup.collect_evidence().unwrap();
        assert_eq!(evidence.memory_peak, Some(1048576));
        assert_eq!(evidence.memory_limit, Some(2097152));
        assert_eq!(evidence.oom_kill_events, 1);
        assert_eq!(evidence.pids_limit_events, 3);
        assert_eq!(evidence.cpu_user_usec, Some(1000));
        assert_eq!(evidence.cpu_system_usec, Some(500));
    }

    #[test]
    fn peak_includes_swap_and_falls_back_to_current() {
        let (_dir, cgroup) = scratch();
        fs::write(cgroup.path().join("memory.current"), "777\n").unwrap();
        assert_eq!(cgroup.memory_peak(), Some(777));

        fs::write(cgroup.path().join("memory.peak"), "1000\n").unwrap();
        fs::write(cgroup.path().join("memory.swap.peak"), "24\n").unwrap();
        assert_eq!(cgroup.memory_peak(), Some(1024));
    }

    #[test]
    fn missing_event_files_read_as_zero() {
        let (_dir, cgroup) = scratch();
        let evidence = cgroup.collect_evidence().unwrap();
        assert_eq!(evidence.oom_kill_events, 0);
        assert_eq!(evidence.pids_limit_events, 0);
        assert_eq!(evidence.memory_limit, None);
    }
}
