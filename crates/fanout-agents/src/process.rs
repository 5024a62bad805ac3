//! Unix process helpers: pid liveness, group kills, and graceful
//! terminate-then-kill.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Check whether a pid refers to a live process. An `EPERM` answer
/// means the process exists but belongs to someone else, which still
/// counts as alive.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// Send a signal to the process group led by `pid`, falling back to
/// the single process when no group exists. A vanished process is not
/// an error.
#[cfg(unix)]
pub fn kill_group(pid: u32, signal: i32) -> io::Result<()> {
    let group_rc = unsafe { libc::kill(-(pid as i32), signal) };
    if group_rc == 0 {
        return Ok(());
    }

    let rc = unsafe { libc::kill(pid as i32, signal) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signals require unix",
    ))
}

/// Ask a process to exit with SIGTERM.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals require unix",
    ))
}

/// SIGTERM, wait up to `grace`, then SIGKILL the whole group.
#[cfg(unix)]
pub fn terminate_then_kill(pid: u32, grace: Duration) -> io::Result<()> {
    if !pid_is_alive(pid) {
        return Ok(());
    }

    terminate(pid)?;

    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    kill_group(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn terminate_then_kill(_pid: u32, _grace: Duration) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals require unix",
    ))
}

/// Locate an executable on PATH. Absolute or relative paths are
/// checked directly.
pub fn find_in_path(executable: &str) -> Option<PathBuf> {
    let candidate = Path::new(executable);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(executable);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}
