//! Process liveness and termination by PID.
//!
//! Supervised peers are killed through their tokio `Child` handle. These
//! helpers cover the cases where only a PID is known: a peer checking on its
//! parent, or a test killing a peer behind the supervisor's back.

use crate::error::{PeerError, Result};
use tracing::debug;

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        windows_is_process_alive(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        tracing::warn!("Process alive check not implemented for this platform");
        true
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn windows_is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ACCESS_DENIED};
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // SAFETY: OpenProcess has no memory-safety preconditions; the returned
    // handle is closed before leaving this block.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if !handle.is_null() {
            CloseHandle(handle);
            true
        } else {
            GetLastError() == ERROR_ACCESS_DENIED
        }
    }
}

/// Forcefully terminate a process.
///
/// Returns `true` if the process was terminated or was not running.
pub fn terminate_process(pid: u32) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGKILL to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(true),
            Err(e) => Err(PeerError::InvalidState(format!(
                "Failed to kill process {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(windows)]
    {
        use std::process::Command;

        debug!("Terminating process {} with taskkill", pid);
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F", "/T"])
            .output()?;
        Ok(output.status.success())
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(PeerError::InvalidState(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_process_is_not_alive() {
        // PIDs this large are not handed out on any supported platform.
        assert!(!is_process_alive(2_147_483_000));
    }

    #[test]
    fn test_terminate_nonexistent_process() {
        assert!(terminate_process(2_147_483_000).unwrap());
    }
}
