//! Process-group plumbing for controlled children. The child leads its own
//! group so that a forwarded stop or kill also reaches whatever it spawned,
//! such as the `ssh` transport below `rsync`.

use std::io;

/// Makes the calling process a group leader. Runs in `pre_exec`.
pub(crate) fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Asks the kernel to send `SIGTERM` to the child once `parent_pid` is gone.
/// Runs in `pre_exec`; `parent_pid` is captured before the fork so a parent
/// that exited in between is noticed.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }
    Ok(())
}

/// Sends `SIGKILL` to the whole group. A group that is already gone is not
/// an error.
pub(crate) fn kill_process_group(process_group_id: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(process_group_id)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if pgid <= 0 {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}
