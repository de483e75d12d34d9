//! POSIX resource limits for the payload.

use crate::config::types::{Result, RlimitEntry, RlimitKind, RunnerError};

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn resource_of(kind: RlimitKind) -> Resource {
    match kind {
        RlimitKind::As => libc::RLIMIT_AS,
        RlimitKind::Core => libc::RLIMIT_CORE,
        RlimitKind::Cpu => libc::RLIMIT_CPU,
        RlimitKind::Data => libc::RLIMIT_DATA,
        RlimitKind::Fsize => libc::RLIMIT_FSIZE,
        RlimitKind::Locks => libc::RLIMIT_LOCKS,
        RlimitKind::Memlock => libc::RLIMIT_MEMLOCK,
        RlimitKind::Msgqueue => libc::RLIMIT_MSGQUEUE,
        RlimitKind::Nice => libc::RLIMIT_NICE,
        RlimitKind::Nofile => libc::RLIMIT_NOFILE,
        RlimitKind::Nproc => libc::RLIMIT_NPROC,
        RlimitKind::Rss => libc::RLIMIT_RSS,
        RlimitKind::Rtprio => libc::RLIMIT_RTPRIO,
        RlimitKind::Rttime => libc::RLIMIT_RTTIME,
        RlimitKind::Sigpending => libc::RLIMIT_SIGPENDING,
        RlimitKind::Stack => libc::RLIMIT_STACK,
    }
}

fn to_rlim(value: u64) -> libc::rlim_t {
    if value == u64::MAX {
        libc::RLIM_INFINITY
    } else {
        value as libc::rlim_t
    }
}

/// Soft and hard values actually handed to setrlimit.
///
/// FSIZE is raised by one byte: a payload may write exactly the configured
/// amount, one byte more raises SIGXFSZ.
pub fn effective_bounds(entry: &RlimitEntry) -> (u64, u64) {
    match entry.kind {
        RlimitKind::Fsize => (entry.soft.saturating_add(1), entry.hard.saturating_add(1)),
        _ => (entry.soft, entry.hard),
    }
}

fn apply_rlimit_value(entry: &RlimitEntry) -> Result<()> {
    let (soft, hard) = effective_bounds(entry);
    let limit = libc::rlimit {
        rlim_cur: to_rlim(soft),
        rlim_max: to_rlim(hard),
    };

    let rc = unsafe { libc::setrlimit(resource_of(entry.kind), &limit) };
    if rc == 0 {
        return Ok(());
    }

    Err(RunnerError::ResourceLimit(format!(
        "Failed to apply {}={} (hard={}): {}",
        entry.kind,
        soft,
        hard,
        std::io::Error::last_os_error()
    )))
}

/// Ceilings the payload gets for kinds the config leaves unset
pub const DEFAULT_RLIMITS: [RlimitEntry; 3] = [
    RlimitEntry {
        kind: RlimitKind::Fsize,
        soft: 256 << 20,
        hard: 256 << 20,
    },
    RlimitEntry {
        kind: RlimitKind::Nofile,
        soft: 256,
        hard: 256,
    },
    RlimitEntry {
        kind: RlimitKind::Core,
        soft: 0,
        hard: 0,
    },
];

/// Configured entries followed by a default for every kind they do not mention
pub fn with_default_rlimits(configured: &[RlimitEntry]) -> Vec<RlimitEntry> {
    let mut entries = configured.to_vec();
    entries.extend(
        DEFAULT_RLIMITS
            .iter()
            .filter(|default| !configured.iter().any(|entry| entry.kind == default.kind)),
    );
    entries
}

/// Apply entries in order; a later entry of the same kind overrides an earlier one
pub fn apply_rlimits(entries: &[RlimitEntry]) -> Result<()> {
    for entry in entries {
        apply_rlimit_value(entry)?;
        log::debug!("Applied {} soft={} hard={}", entry.kind, entry.soft, entry.hard);
    }
    Ok(())
}

/// Current (soft, hard) of `kind` for the calling process
pub fn current_rlimit(kind: RlimitKind) -> Result<(u64, u64)> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(resource_of(kind), &mut limit) };
    if rc != 0 {
        return Err(RunnerError::ResourceLimit(format!(
            "getrlimit({}) failed: {}",
            kind,
            std::io::Error::last_os_error()
        )));
    }
    Ok((limit.rlim_cur as u64, limit.rlim_max as u64))
}
