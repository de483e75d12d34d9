/// Core types and structures for the runbox pipeline
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Error types for runbox operations
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration field `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Run cancelled by signal {0}")]
    Cancelled(i32),
}

impl RunnerError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        RunnerError::Config {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<nix::errno::Errno> for RunnerError {
    fn from(errno: nix::errno::Errno) -> Self {
        RunnerError::Process(format!("System call failed: {}", errno))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Overlay layers composing the sandbox root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayers {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

/// Where the sandbox root comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootfsSource {
    /// Plain directory, bind mounted and made read-only
    Directory(PathBuf),
    /// Overlay of a read-only lower layer and a writable upper layer
    Overlay(OverlayLayers),
}

impl RootfsSource {
    /// Directory that becomes `/` inside the sandbox
    pub fn root_dir(&self) -> &PathBuf {
        match self {
            RootfsSource::Directory(path) => path,
            RootfsSource::Overlay(layers) => &layers.merged_dir,
        }
    }
}

/// Per-mount access options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    pub read_write: bool,
    pub executable: bool,
    pub overlay_root: bool,
}

/// A bind mount, destination already normalized to an absolute in-sandbox path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: MountOptions,
}

/// POSIX resource kinds accepted in `limits.rlimit`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RlimitKind {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
}

impl RlimitKind {
    /// Accepts `RLIMIT_NOFILE`, `nofile` and the legacy `no_file` spellings
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("RLIMIT_").unwrap_or(&upper).replace('_', "");
        let kind = match bare.as_str() {
            "AS" => RlimitKind::As,
            "CORE" => RlimitKind::Core,
            "CPU" => RlimitKind::Cpu,
            "DATA" => RlimitKind::Data,
            "FSIZE" => RlimitKind::Fsize,
            "LOCKS" => RlimitKind::Locks,
            "MEMLOCK" => RlimitKind::Memlock,
            "MSGQUEUE" => RlimitKind::Msgqueue,
            "NICE" => RlimitKind::Nice,
            "NOFILE" => RlimitKind::Nofile,
            "NPROC" => RlimitKind::Nproc,
            "RSS" => RlimitKind::Rss,
            "RTPRIO" => RlimitKind::Rtprio,
            "RTTIME" => RlimitKind::Rttime,
            "SIGPENDING" => RlimitKind::Sigpending,
            "STACK" => RlimitKind::Stack,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            RlimitKind::As => "RLIMIT_AS",
            RlimitKind::Core => "RLIMIT_CORE",
            RlimitKind::Cpu => "RLIMIT_CPU",
            RlimitKind::Data => "RLIMIT_DATA",
            RlimitKind::Fsize => "RLIMIT_FSIZE",
            RlimitKind::Locks => "RLIMIT_LOCKS",
            RlimitKind::Memlock => "RLIMIT_MEMLOCK",
            RlimitKind::Msgqueue => "RLIMIT_MSGQUEUE",
            RlimitKind::Nice => "RLIMIT_NICE",
            RlimitKind::Nofile => "RLIMIT_NOFILE",
            RlimitKind::Nproc => "RLIMIT_NPROC",
            RlimitKind::Rss => "RLIMIT_RSS",
            RlimitKind::Rtprio => "RLIMIT_RTPRIO",
            RlimitKind::Rttime => "RLIMIT_RTTIME",
            RlimitKind::Sigpending => "RLIMIT_SIGPENDING",
            RlimitKind::Stack => "RLIMIT_STACK",
        }
    }
}

impl fmt::Display for RlimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitEntry {
    pub kind: RlimitKind,
    pub soft: u64,
    pub hard: u64,
}

/// cgroup ceilings; `None` leaves the controller at its default
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupLimits {
    pub memory: Option<u64>,
    /// Soft memory floor/target, written as memory.low or memory.soft_limit_in_bytes
    pub memory_reservation: Option<u64>,
    pub memory_swap: Option<u64>,
    pub cpu_shares: Option<u64>,
    /// Microseconds of CPU per [`CPU_PERIOD_USEC`]; negative means unlimited
    pub cpu_quota: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub pids: Option<u64>,
}

/// CFS period paired with `cpu_quota`
pub const CPU_PERIOD_USEC: u64 = 100_000;

impl CgroupLimits {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// cgroup v1 shares mapped onto the v2 `cpu.weight` range 1..=10000
    pub fn cpu_weight(&self) -> Option<u64> {
        self.cpu_shares
            .map(|shares| 1 + (shares.clamp(2, 262_144) - 2) * 9999 / 262_142)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock bound in milliseconds
    pub wall_time_ms: Option<u64>,
    /// User CPU bound in milliseconds
    pub user_time_ms: Option<u64>,
    /// Kernel CPU bound in milliseconds
    pub kernel_time_ms: Option<u64>,
    pub rlimits: Vec<RlimitEntry>,
    pub cgroup: CgroupLimits,
}

impl Limits {
    pub fn rlimit(&self, kind: RlimitKind) -> Option<&RlimitEntry> {
        self.rlimits.iter().rev().find(|entry| entry.kind == kind)
    }

    /// Configured output ceiling used for runner-side overflow detection
    pub fn output_limit_bytes(&self) -> Option<u64> {
        self.rlimit(RlimitKind::Fsize).map(|entry| entry.hard)
    }
}

/// Host-side range an in-namespace id block maps onto
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// Host id that in-namespace 0 maps to
    pub root_id: u32,
    /// First host id of the subordinate range mapped to in-namespace 1..
    pub range_begin: u32,
    pub range_count: u32,
}

/// Payload identity inside the sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Where a payload standard stream is connected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdioTarget {
    Inherit,
    Null,
    File(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub stdin: StdioTarget,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            stdin: StdioTarget::Inherit,
            stdout: StdioTarget::Null,
            stderr: StdioTarget::Inherit,
        }
    }
}

/// Parsed, validated and immutable description of one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub rootfs: RootfsSource,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    /// Extra directories appended to the payload PATH
    pub paths: Vec<String>,
    pub mounts: Vec<Mount>,
    pub limits: Limits,
    pub namespaces: crate::config::policy::userns::NamespaceConfig,
    pub stdio: StdioConfig,
    pub user: Option<Identity>,
    pub cgroup_parent: Option<PathBuf>,
}

/// Final classification, serialized with the wire names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Normal,
    RuntimeError,
    SignalTerminate,
    TimeLimitExceeded,
    UserTimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Normal => "NORMAL",
            ExecutionStatus::RuntimeError => "RUNTIME_ERROR",
            ExecutionStatus::SignalTerminate => "SIGNAL_TERMINATE",
            ExecutionStatus::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            ExecutionStatus::UserTimeLimitExceeded => "USER_TIME_LIMIT_EXCEEDED",
            ExecutionStatus::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ExecutionStatus::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the payload process ended, as observed by its reaper
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled(i32),
}

/// Counters read from the run's cgroup after the payload exited
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupEvidence {
    pub memory_peak: Option<u64>,
    pub memory_limit: Option<u64>,
    pub oom_kill_events: u64,
    pub pids_limit_events: u64,
    pub cpu_user_usec: Option<u64>,
    pub cpu_system_usec: Option<u64>,
}

/// Which watchdog condition ended the run, if any
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogBreach {
    WallTime,
    UserTime,
    ProcessLimit,
}

/// Everything the classifier looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvidenceBundle {
    pub wait_outcome: WaitOutcome,
    pub breach: Option<WatchdogBreach>,
    pub cgroup: Option<CgroupEvidence>,
    /// A runner-owned redirection grew past the configured fsize ceiling
    pub output_overflow: bool,
    pub wall_time_ms: u64,
    pub cpu_user_ms: u64,
    pub cpu_kernel_ms: u64,
    /// Peak memory of the run in bytes
    pub memory_peak_bytes: u64,
}

/// Limit values the classifier compares against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LimitSnapshot {
    pub wall_time_ms: Option<u64>,
    pub user_time_ms: Option<u64>,
    pub kernel_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub memory_swap_bytes: Option<u64>,
}

impl LimitSnapshot {
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            wall_time_ms: limits.wall_time_ms,
            user_time_ms: limits.user_time_ms,
            kernel_time_ms: limits.kernel_time_ms,
            memory_bytes: limits.cgroup.memory,
            memory_swap_bytes: limits.cgroup.memory_swap,
        }
    }
}
