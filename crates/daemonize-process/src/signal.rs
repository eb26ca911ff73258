//! Thin wrappers over the process-group syscalls.

use std::io;

pub(crate) fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

pub(crate) fn signal_name(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGTERM => "sigterm",
        libc::SIGINT => "sigint",
        libc::SIGKILL => "sigkill",
        _ => "signal",
    }
}

pub(crate) fn process_group(pid: u32) -> io::Result<i32> {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(pgid)
}

/// Sends `sig` to every process in group `pgid`.
pub(crate) fn kill_group(pgid: i32, sig: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Like [`kill_group`], but a group that is already gone counts as delivered.
pub(crate) fn kill_group_tolerant(pgid: i32, sig: libc::c_int) -> io::Result<()> {
    match kill_group(pgid, sig) {
        Err(e) if is_no_such_process(&e) => Ok(()),
        other => other,
    }
}
