//! Emptying the payload's capability sets just before exec.

use super::{last_capability, CapabilitySets};
use crate::config::types::{Result, RunnerError};

const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Clear bounding and ambient sets where allowed, then zero the thread's
/// own sets. Fails if anything usable is left afterwards.
pub fn drop_all_capabilities() -> Result<()> {
    let refused = clear_bounding_set();
    if refused > 0 {
        log::debug!("{} bounding capabilities could not be dropped", refused);
    }

    // SAFETY: no pointers; EINVAL on kernels without ambient capabilities
    if unsafe { libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) } != 0 {
        log::debug!("ambient clear: {}", std::io::Error::last_os_error());
    }

    zero_thread_sets()?;

    let remaining = CapabilitySets::current()?;
    if !remaining.is_unprivileged() {
        return Err(RunnerError::Privilege(format!(
            "capabilities survived the drop: {:?}",
            remaining
        )));
    }
    Ok(())
}

/// Returns how many capabilities stayed in the bounding set
fn clear_bounding_set() -> u32 {
    (0..=last_capability())
        .filter(|cap| {
            // SAFETY: plain integer arguments
            unsafe { libc::prctl(libc::PR_CAPBSET_DROP, *cap as libc::c_ulong, 0, 0, 0) != 0 }
        })
        .count() as u32
}

/// Lowering one's own sets never needs privilege
fn zero_thread_sets() -> Result<()> {
    let header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData::default(); 2];

    // SAFETY: both pointers reference live repr(C) values of the v3 layout
    let rc = unsafe { libc::syscall(libc::SYS_capset, &header as *const CapHeader, data.as_ptr()) };
    if rc != 0 {
        return Err(RunnerError::Privilege(format!(
            "capset: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Forbid privilege gain through exec. Irreversible.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: plain integer arguments
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(RunnerError::Privilege(format!(
            "PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
