//! Small OS process helpers shared by the config-version sidecar
//! recovery and the process controller.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Probe whether a pid refers to a live process.
///
/// Signal 0 delivers nothing but runs the full permission and existence
/// checks. `EPERM` means the process exists but belongs to someone
/// else, which still counts as alive. Any other failure is reported as
/// a probe failure rather than guessed at.
pub fn is_pid_alive(pid: u32) -> Result<bool> {
    if pid == 0 {
        return Ok(false);
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(Error::ChildCheckFailed(format!(
            "liveness probe of pid {} failed: {}",
            pid, e
        ))),
    }
}

/// Send the OS termination signal: SIGKILL for a kill, SIGTERM for a
/// graceful stop.
pub fn kill_pid(pid: u32, hard: bool) -> Result<()> {
    let sig = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::ChildCheckFailed(format!(
            "signalling pid {} failed: {}",
            pid, e
        ))),
    }
}

pub fn own_pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(own_pid()).unwrap());
    }

    #[test]
    fn test_pid_zero_not_alive() {
        assert!(!is_pid_alive(0).unwrap());
    }
}
