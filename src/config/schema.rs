//! Wire schema of the input document.
//!
//! Version 2 is canonical. Shapes inherited from the first generation of the
//! contract (`time_ms`, map-valued `rlimit`, top-level `overlayfs`, `rootless`)
//! are modelled as explicit enum variants so the validator can log and, under
//! `version: 2`, reject them.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub rootfs: Option<RootfsDoc>,
    /// First-generation spelling of an overlay rootfs
    #[serde(default)]
    pub overlayfs: Option<OverlayDoc>,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountDoc>,
    #[serde(default)]
    pub limits: Option<LimitsDoc>,
    #[serde(default)]
    pub user_namespace: Option<UserNamespaceDoc>,
    /// First-generation switch: map the namespace onto the invoking user
    #[serde(default)]
    pub rootless: Option<bool>,
    #[serde(default)]
    pub fd: Option<FdDoc>,
    #[serde(default)]
    pub user: Option<IdentityDoc>,
    #[serde(default, alias = "cgroup_path")]
    pub cgroup_parent: Option<PathBuf>,
    #[serde(default)]
    pub network: Option<NetworkDoc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RootfsDoc {
    Path(PathBuf),
    Overlay(OverlayDoc),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayDoc {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountDoc {
    pub from: PathBuf,
    pub to: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsDoc {
    #[serde(default)]
    pub time: Option<TimeDoc>,
    /// First-generation single time bound
    #[serde(default)]
    pub time_ms: Option<u64>,
    #[serde(default)]
    pub rlimit: Option<RlimitDoc>,
    #[serde(default)]
    pub cgroup: Option<CgroupDoc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeDoc {
    #[serde(default)]
    pub wall: Option<u64>,
    #[serde(default)]
    pub user: Option<u64>,
    #[serde(default)]
    pub kernel: Option<u64>,
}

/// Resolved view of the two time-bound shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimitsDoc {
    Structured {
        wall: Option<u64>,
        user: Option<u64>,
        kernel: Option<u64>,
    },
    Legacy { time_ms: u64 },
    Unset,
}

impl LimitsDoc {
    /// The structured `time` object wins when both shapes are present
    pub fn time_limits(&self) -> TimeLimitsDoc {
        match (&self.time, self.time_ms) {
            (Some(time), _) => TimeLimitsDoc::Structured {
                wall: time.wall,
                user: time.user,
                kernel: time.kernel,
            },
            (None, Some(time_ms)) => TimeLimitsDoc::Legacy { time_ms },
            (None, None) => TimeLimitsDoc::Unset,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RlimitDoc {
    /// `[{"type": "RLIMIT_FSIZE", "soft": .., "hard": ..}]`
    List(Vec<RlimitEntryDoc>),
    /// First-generation `{"fsize": {"soft": .., "hard": ..}}`
    Map(BTreeMap<String, RlimitBoundsDoc>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RlimitEntryDoc {
    #[serde(rename = "type")]
    pub kind: String,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RlimitBoundsDoc {
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CgroupDoc {
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub memory_reservation: Option<u64>,
    #[serde(default)]
    pub memory_swap: Option<u64>,
    /// Relative CPU weight in cgroup v1 shares (2..=262144)
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    /// CFS quota in microseconds per 100ms period
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub cpuset_cpus: Option<String>,
    #[serde(default)]
    pub cpuset_mems: Option<String>,
    #[serde(default)]
    pub pids_limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserNamespaceDoc {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub root_uid: Option<u32>,
    #[serde(default)]
    pub uid_map_begin: Option<u32>,
    #[serde(default)]
    pub uid_map_count: Option<u32>,
    #[serde(default)]
    pub root_gid: Option<u32>,
    #[serde(default)]
    pub gid_map_begin: Option<u32>,
    #[serde(default)]
    pub gid_map_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FdDoc {
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityDoc {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDoc {
    #[serde(default = "default_true")]
    pub isolated: bool,
}

fn default_true() -> bool {
    true
}
