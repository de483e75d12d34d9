/// File descriptor closure for the payload
/// Everything above stderr is closed, except an explicit keep list (the
/// close-on-exec error pipe). close_range is preferred, /proc/self/fd is the
/// fallback.
use crate::config::types::{Result, RunnerError};
use nix::unistd::close;
use std::fs;
use std::os::unix::io::RawFd;

const FIRST_INHERITED_FD: RawFd = 3;

/// Close all file descriptors except stdin, stdout, stderr and `keep`
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    if try_close_range(keep) {
        log::debug!("Closed inherited FDs using close_range (kept {:?})", keep);
        return Ok(());
    }

    close_fds_via_proc(keep)
}

/// Inclusive ranges above stderr that skip every fd in `keep`
pub fn closable_ranges(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut kept: Vec<RawFd> = keep
        .iter()
        .copied()
        .filter(|fd| *fd >= FIRST_INHERITED_FD)
        .collect();
    kept.sort_unstable();
    kept.dedup();

    let mut ranges = Vec::with_capacity(kept.len() + 1);
    let mut start = FIRST_INHERITED_FD as u32;
    for fd in kept {
        let fd = fd as u32;
        if fd > start {
            ranges.push((start, fd - 1));
        }
        start = fd + 1;
    }
    ranges.push((start, u32::MAX));
    ranges
}

fn try_close_range(keep: &[RawFd]) -> bool {
    closable_ranges(keep).into_iter().all(|(first, last)| {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                last as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        rc == 0
    })
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    // Collect first: closing while iterating would close the directory fd
    let fds = get_open_fds()?;

    let mut failed_closes = Vec::new();
    for fd in fds {
        if fd < FIRST_INHERITED_FD || keep.contains(&fd) {
            continue;
        }
        if let Err(e) = close(fd) {
            if e != nix::errno::Errno::EBADF {
                failed_closes.push(format!("fd {}: {}", fd, e));
            }
        }
    }

    if !failed_closes.is_empty() {
        return Err(RunnerError::Process(format!(
            "Failed to close {} FD(s): {}",
            failed_closes.len(),
            failed_closes.join(", ")
        )));
    }

    log::debug!("Closed inherited FDs via /proc/self/fd");
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| RunnerError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse().ok())
        .collect();

    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn ranges_skip_kept_fds() {
        assert_eq!(closable_ranges(&[]), vec![(3, u32::MAX)]);
        assert_eq!(closable_ranges(&[5]), vec![(3, 4), (6, u32::MAX)]);
        assert_eq!(closable_ranges(&[3, 4, 2]), vec![(5, u32::MAX)]);
        assert_eq!(closable_ranges(&[9, 7, 9]), vec![(3, 6), (8, 8), (10, u32::MAX)]);
    }

    #[test]
    fn kept_fd_survives_closure() {
        // Closing fds would break the test harness; do it in a child
        let (keep_read, keep_write) = nix::unistd::pipe().unwrap();
        let (other_read, _other_write) = nix::unistd::pipe().unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = close_inherited_fds(&[keep_write]).is_ok()
                    && get_open_fds()
                        .map(|fds| fds.contains(&keep_write) && !fds.contains(&other_read))
                        .unwrap_or(false);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            ForkResult::Parent { child } => {
                let _ = close(keep_read);
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
