//! Cgroup v1 resource governance.

use crate::config::types::{CgroupEvidence, CgroupLimits, Result, RunnerError, CPU_PERIOD_USEC};
use crate::kernel::cgroup::backend::{
    parse_keyed, read_keyed, read_u64, remove_cgroup_dir, write_control, CgroupBackend, CpuUsage,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

const REQUIRED_CONTROLLERS: [&str; 2] = ["memory", "pids"];
const OPTIONAL_CONTROLLERS: [&str; 3] = ["cpuacct", "cpu", "cpuset"];

/// Cgroup v1 backend: one directory per controller hierarchy
pub struct CgroupV1 {
    paths: BTreeMap<&'static str, PathBuf>,
    memory_path: PathBuf,
}

impl CgroupV1 {
    /// Create `<root>/<controller>/<relative>` for every controller the run needs
    pub fn create(root: &Path, relative: &Path) -> Result<Self> {
        let mut paths = BTreeMap::new();

        for controller in REQUIRED_CONTROLLERS {
            let hierarchy = root.join(controller);
            if !hierarchy.exists() {
                return Err(RunnerError::Cgroup(format!(
                    "Required controller '{}' not mounted under {}",
                    controller,
                    root.display()
                )));
            }
            paths.insert(controller, create_dir(&hierarchy.join(relative))?);
        }

        for controller in OPTIONAL_CONTROLLERS {
            let hierarchy = root.join(controller);
            if !hierarchy.exists() {
                log::warn!("Controller '{}' not mounted under {}", controller, root.display());
                continue;
            }
            let dir = create_dir(&hierarchy.join(relative))?;
            if controller == "cpuset" {
                seed_cpuset(&hierarchy, relative)?;
            }
            paths.insert(controller, dir);
        }

        Self::from_paths(paths)
    }

    fn from_paths(paths: BTreeMap<&'static str, PathBuf>) -> Result<Self> {
        let memory_path = paths
            .get("memory")
            .cloned()
            .ok_or_else(|| RunnerError::Cgroup("Memory controller path not available".to_string()))?;
        Ok(Self { paths, memory_path })
    }

    fn controller(&self, name: &str) -> Result<&Path> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| RunnerError::Cgroup(format!("{} controller path not available", name)))
    }

    fn memory_peak(&self) -> Option<u64> {
        let memory = read_u64(&self.memory_path.join("memory.max_usage_in_bytes"))
            .ok()
            .flatten();
        let memsw = read_u64(&self.memory_path.join("memory.memsw.max_usage_in_bytes"))
            .ok()
            .flatten();
        match (memory, memsw) {
            (Some(memory), Some(memsw)) => Some(memory.max(memsw)),
            (memory, memsw) => memory.or(memsw),
        }
    }
}

fn create_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path).map_err(|e| {
        RunnerError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
    })?;
    Ok(path.to_path_buf())
}

/// A new cpuset cgroup starts with empty cpus/mems and refuses tasks.
/// Copy each level's values down from its parent.
fn seed_cpuset(hierarchy: &Path, relative: &Path) -> Result<()> {
    let mut dir = hierarchy.to_path_buf();
    for component in relative.components() {
        if !matches!(component, Component::Normal(_)) {
            continue;
        }
        let parent = dir.clone();
        dir.push(component);
        for file in ["cpuset.cpus", "cpuset.mems"] {
            let current = fs::read_to_string(dir.join(file)).unwrap_or_default();
            if !current.trim().is_empty() {
                continue;
            }
            let inherited = fs::read_to_string(parent.join(file)).map_err(|e| {
                RunnerError::Cgroup(format!("Failed to read {}: {}", parent.join(file).display(), e))
            })?;
            write_control(&dir, file, inherited.trim())?;
        }
    }
    Ok(())
}

/// Clock ticks per second used by cpuacct.stat
fn clock_ticks() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn ticks_to_usec(ticks: u64, hz: u64) -> u64 {
    ticks.saturating_mul(1_000_000) / hz.max(1)
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v1"
    }

    fn path(&self) -> &Path {
        &self.memory_path
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()> {
        if let Some(memory) = limits.memory {
            write_control(&self.memory_path, "memory.limit_in_bytes", &memory.to_string())?;
            let swappiness = self.memory_path.join("memory.swappiness");
            if swappiness.exists() && limits.memory_swap.is_none() {
                let _ = fs::write(&swappiness, "0");
            }
        }

        if let Some(memory_swap) = limits.memory_swap {
            if self.memory_path.join("memory.memsw.limit_in_bytes").exists() {
                write_control(
                    &self.memory_path,
                    "memory.memsw.limit_in_bytes",
                    &memory_swap.to_string(),
                )?;
            } else {
                log::warn!(
                    "Swap accounting unavailable; memory+swap ceiling of {} not enforced",
                    memory_swap
                );
            }
        }

        if let Some(reservation) = limits.memory_reservation {
            write_control(
                &self.memory_path,
                "memory.soft_limit_in_bytes",
                &reservation.to_string(),
            )?;
        }

        if let Some(pids) = limits.pids {
            write_control(self.controller("pids")?, "pids.max", &pids.to_string())?;
        }

        if let Some(shares) = limits.cpu_shares {
            write_control(self.controller("cpu")?, "cpu.shares", &shares.to_string())?;
        }
        if let Some(quota) = limits.cpu_quota {
            let cpu = self.controller("cpu")?;
            write_control(cpu, "cpu.cfs_period_us", &CPU_PERIOD_USEC.to_string())?;
            write_control(cpu, "cpu.cfs_quota_us", &quota.max(-1).to_string())?;
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            write_control(self.controller("cpuset")?, "cpuset.cpus", cpus)?;
        }
        if let Some(mems) = &limits.cpuset_mems {
            write_control(self.controller("cpuset")?, "cpuset.mems", mems)?;
        }

        Ok(())
    }

    fn attach_process(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        for path in self.paths.values() {
            write_control(path, "tasks", &pid)?;
        }
        Ok(())
    }

    fn cpu_usage(&self) -> Result<CpuUsage> {
        let stat = self.controller("cpuacct")?.join("cpuacct.stat");
        let content = fs::read_to_string(&stat)
            .map_err(|e| RunnerError::Cgroup(format!("Failed to read {}: {}", stat.display(), e)))?;
        let hz = clock_ticks();
        Ok(CpuUsage {
            user_usec: ticks_to_usec(parse_keyed(&content, "user").unwrap_or(0), hz),
            system_usec: ticks_to_usec(parse_keyed(&content, "system").unwrap_or(0), hz),
        })
    }

    fn pids_limit_hits(&self) -> Result<u64> {
        Ok(read_keyed(&self.controller("pids")?.join("pids.events"), "max").unwrap_or(0))
    }

    fn collect_evidence(&self) -> Result<CgroupEvidence> {
        let cpu = self.cpu_usage().ok();
        Ok(CgroupEvidence {
            memory_peak: self.memory_peak(),
            memory_limit: read_u64(&self.memory_path.join("memory.limit_in_bytes"))
                .ok()
                .flatten(),
            oom_kill_events: read_keyed(&self.memory_path.join("memory.oom_control"), "oom_kill")
                .unwrap_or(0),
            pids_limit_events: self.pids_limit_hits()?,
            cpu_user_usec: cpu.map(|c| c.user_usec),
            cpu_system_usec: cpu.map(|c| c.system_usec),
        })
    }

    fn remove(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (controller, path) in &self.paths {
            if let Err(e) = remove_cgroup_dir(path) {
                errors.push(format!("{}: {}", controller, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Cgroup(format!(
                "Some cgroup cleanup operations failed: {:?}",
                errors
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for controller in ["memory", "pids", "cpuacct"] {
            fs::create_dir(root.path().join(controller)).unwrap();
        }
        root
    }

    #[test]
    fn create_requires_memory_and_pids() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("memory")).unwrap();
        assert!(CgroupV1::create(root.path(), Path::new("runbox/run")).is_err());
    }

    #[test]
    fn create_makes_one_directory_per_controller() {
        let root = scratch_root();
        let cgroup = CgroupV1::create(root.path(), Path::new("runbox/run")).unwrap();
        for controller in ["memory", "pids", "cpuacct"] {
            assert!(root.path().join(controller).join("runbox/run").is_dir());
        }
        assert_eq!(cgroup.path(), root.path().join("memory/runbox/run"));
    }

    #[test]
    fn limits_and_evidence_round_through_control_files() {
        let root = scratch_root();
        let cgroup = CgroupV1::create(root.path(), Path::new("run")).unwrap();
        let memory = root.path().join("memory/run");
        fs::write(memory.join("memory.memsw.limit_in_bytes"), "0").unwrap();

        cgroup
            .apply_limits(&CgroupLimits {
                memory: Some(64 << 20),
                memory_swap: Some(128 << 20),
                pids: Some(4),
                ..CgroupLimits::default()
            })
            .unwrap();
        assert_eq!(
            fs::read_to_string(memory.join("memory.memsw.limit_in_bytes")).unwrap(),
            (128u64 << 20).to_string()
        );
        assert_eq!(fs::read_to_string(root.path().join("pids/run/pids.max")).unwrap(), "4");

        fs::write(memory.join("memory.max_usage_in_bytes"), "5000\n").unwrap();
        fs::write(memory.join("memory.oom_control"), "oom_kill_disable 0\nunder_oom 0\noom_kill 2\n").unwrap();
        fs::write(root.path().join("pids/run/pids.events"), "max 1\n").unwrap();
        fs::write(root.path().join("cpuacct/run/cpuacct.stat"), "user 0\nsystem 0\n").unwrap();

        let evidence = cgroup.collect_evidence().unwrap();
        assert_eq!(evidence.memory_peak, Some(5000));
        assert_eq!(evidence.memory_limit, Some(64 << 20));
        assert_eq!(evidence.oom_kill_events, 2);
        assert_eq!(evidence.pids_limit_events, 1);
        assert_eq!(evidence.cpu_user_usec, Some(0));
    }

    #[test]
    fn cpu_controls_go_to_their_hierarchies() {
        let root = scratch_root();
        for controller in ["cpu", "cpuset"] {
            fs::create_dir(root.path().join(controller)).unwrap();
        }
        fs::write(root.path().join("cpuset/cpuset.cpus"), "0-7\n").unwrap();
        fs::write(root.path().join("cpuset/cpuset.mems"), "0\n").unwrap();

        let cgroup = CgroupV1::create(root.path(), Path::new("runbox/run")).unwrap();
        let read = |path: &str| fs::read_to_string(root.path().join(path)).unwrap();
        assert_eq!(read("cpuset/runbox/cpuset.cpus"), "0-7");
        assert_eq!(read("cpuset/runbox/run/cpuset.mems"), "0");

        cgroup
            .apply_limits(&CgroupLimits {
                memory_reservation: Some(1 << 20),
                cpu_shares: Some(512),
                cpu_quota: Some(50_000),
                cpuset_cpus: Some("1".to_string()),
                ..CgroupLimits::default()
            })
            .unwrap();
        assert_eq!(read("memory/runbox/run/memory.soft_limit_in_bytes"), (1u64 << 20).to_string());
        assert_eq!(read("cpu/runbox/run/cpu.shares"), "512");
        assert_eq!(read("cpu/runbox/run/cpu.cfs_period_us"), "100000");
        assert_eq!(read("cpu/runbox/run/cpu.cfs_quota_us"), "50000");
        assert_eq!(read("cpuset/runbox/run/cpuset.cpus"), "1");
        assert_eq!(read("cpuset/runbox/run/cpuset.mems"), "0");
    }

    #[test]
    fn cpu_limit_without_cpu_hierarchy_is_an_error() {
        let root = scratch_root();
        let cgroup = CgroupV1::create(root.path(), Path::new("run")).unwrap();
        let result = cgroup.apply_limits(&CgroupLimits {
            cpu_shares: Some(512),
            ..CgroupLimits::default()
        });
        assert!(matches!(result, Err(RunnerError::Cgroup(_))));
    }

    #[test]
    fn ticks_convert_to_microseconds() {
        assert_eq!(ticks_to_usec(150, 100), 1_500_000);
        assert_eq!(ticks_to_usec(1, 0), 1_000_000);
    }
}
