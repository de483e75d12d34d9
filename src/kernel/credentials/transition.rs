//! Transition to the configured unprivileged identity.
//!
//! setresgid must happen before setresuid: once the uid is gone the process
//! can no longer change its groups.

use super::validation::validate_ids;
use crate::config::types::{Identity, Result, RunnerError};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups, setresgid, setresuid, Gid, Uid};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
pub fn transition_to_unprivileged(identity: Identity) -> Result<()> {
    let Identity { uid, gid } = identity;
    validate_ids(uid, gid)?;

    setgroups(&[]).map_err(|e| {
        RunnerError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;

    let gid = Gid::from_raw(gid);
    setresgid(gid, gid, gid)
        .map_err(|e| RunnerError::Privilege(format!("Failed to setresgid({}): {}", gid, e)))?;

    let uid = Uid::from_raw(uid);
    setresuid(uid, uid, uid)
        .map_err(|e| RunnerError::Privilege(format!("Failed to setresuid({}): {}", uid, e)))?;

    verify_transition(uid, gid)?;
    log::debug!("Transitioned to UID={}, GID={}", uid, gid);
    Ok(())
}

/// Switch to uid/gid 0 inside a freshly mapped user namespace.
///
/// A cloned init keeps the overflow ids it was created with until it asks
/// for the mapped root explicitly. Groups are only cleared when the
/// namespace still allows setgroups.
pub fn become_namespace_root() -> Result<()> {
    if setgroups_allowed(&std::fs::read_to_string("/proc/self/setgroups").unwrap_or_default()) {
        setgroups(&[Gid::from_raw(0)]).map_err(|e| {
            RunnerError::Privilege(format!("Failed to reset groups in user namespace: {}", e))
        })?;
    }

    let root_gid = Gid::from_raw(0);
    setresgid(root_gid, root_gid, root_gid).map_err(|e| {
        RunnerError::Privilege(format!("Failed to become gid 0 in user namespace: {}", e))
    })?;
    let root_uid = Uid::from_raw(0);
    setresuid(root_uid, root_uid, root_uid).map_err(|e| {
        RunnerError::Privilege(format!("Failed to become uid 0 in user namespace: {}", e))
    })?;

    verify_transition(root_uid, root_gid)?;
    log::debug!("Acting as root of the user namespace");
    Ok(())
}

/// `/proc/<pid>/setgroups` reads "allow" or "deny"
fn setgroups_allowed(content: &str) -> bool {
    content.trim() != "deny"
}

fn verify_transition(expected_uid: Uid, expected_gid: Gid) -> Result<()> {
    if getuid() != expected_uid || geteuid() != expected_uid {
        return Err(RunnerError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected_uid,
            getuid(),
            geteuid()
        )));
    }
    if getgid() != expected_gid || getegid() != expected_gid {
        return Err(RunnerError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected_gid,
            getgid(),
            getegid()
        )));
    }
    Ok(())
}
