//! Linux capability management for the payload.
//!
//! The payload must reach exec with empty permitted and effective sets and
//! `no_new_privs` set. Bounding and ambient cleanup is best effort.

mod drop;

pub use drop::{drop_all_capabilities, set_no_new_privs};

use crate::config::types::{Result, RunnerError};

/// Highest capability number any supported kernel defines
const FALLBACK_LAST_CAP: u32 = 40;

/// Highest capability the running kernel knows about
pub fn last_capability() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(FALLBACK_LAST_CAP)
}

/// Capability masks of the calling thread as shown in `/proc/self/status`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySets {
    pub inheritable: u64,
    pub permitted: u64,
    pub effective: u64,
    pub bounding: u64,
    pub ambient: u64,
}

impl CapabilitySets {
    pub fn current() -> Result<Self> {
        let status = std::fs::read_to_string("/proc/thread-self/status")
            .or_else(|_| std::fs::read_to_string("/proc/self/status"))?;
        Ok(Self::parse(&status))
    }

    /// Missing or malformed lines read as an empty mask
    pub fn parse(status: &str) -> Self {
        let mut sets = Self::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Ok(mask) = u64::from_str_radix(value.trim(), 16) else {
                continue;
            };
            match key {
                "CapInh" => sets.inheritable = mask,
                "CapPrm" => sets.permitted = mask,
                "CapEff" => sets.effective = mask,
                "CapBnd" => sets.bounding = mask,
                "CapAmb" => sets.ambient = mask,
                _ => {}
            }
        }
        sets
    }

    /// Nothing the payload could use is left
    pub fn is_unprivileged(&self) -> bool {
        self.permitted == 0 && self.effective == 0 && self.inheritable == 0 && self.ambient == 0
    }
}

/// Read back PR_GET_NO_NEW_PRIVS
pub fn check_no_new_privs() -> Result<bool> {
    // SAFETY: PR_GET_NO_NEW_PRIVS takes no pointers.
    let result = unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if result < 0 {
        return Err(RunnerError::Privilege(format!(
            "PR_GET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(result == 1)
}

/// Current real/effective ids, for logging
pub fn current_ids() -> String {
    use nix::unistd::{getegid, geteuid, getgid, getuid};
    format!(
        "uid={} euid={} gid={} egid={}",
        getuid(),
        geteuid(),
        getgid(),
        getegid()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_STATUS: &str = "Name:\tcat\n\
        CapInh:\t0000000000000000\n\
        CapPrm:\t000001ffffffffff\n\
        CapEff:\t000001ffffffffff\n\
        CapBnd:\t000001ffffffffff\n\
        CapAmb:\t0000000000000000\n\
        NoNewPrivs:\t0\n";

    #[test]
    fn parses_status_masks() {
        let sets = CapabilitySets::parse(ROOT_STATUS);
        assert_eq!(sets.permitted, 0x1ff_ffff_ffff);
        assert_eq!(sets.effective, 0x1ff_ffff_ffff);
        assert_eq!(sets.inheritable, 0);
        assert!(!sets.is_unprivileged());
    }

    #[test]
    fn empty_sets_are_unprivileged() {
        let status = ROOT_STATUS
            .replace("CapPrm:\t000001ffffffffff", "CapPrm:\t0000000000000000")
            .replace("CapEff:\t000001ffffffffff", "CapEff:\t0000000000000000");
        let sets = CapabilitySets::parse(&status);
        // bounding set alone grants nothing
        assert!(sets.is_unprivileged());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let sets = CapabilitySets::parse("CapEff: zz\nnonsense\n");
        assert_eq!(sets, CapabilitySets::default());
    }

    #[test]
    fn last_capability_is_plausible() {
        let last = last_capability();
        assert!(last >= 30 && last <= 63);
    }

    #[test]
    fn no_new_privs_reads_back() {
        assert!(check_no_new_privs().is_ok());
    }
}
