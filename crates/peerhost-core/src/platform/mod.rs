//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here:
//! - `process` - liveness checks and termination by PID
//!
//! The [`EnvironmentInfo`] trait reports host facts the pool needs to size
//! itself. [`SystemEnvironment`] reads them from the running machine.

pub mod process;

pub use process::{is_process_alive, terminate_process};

use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Host facts consumed by the service layer.
pub trait EnvironmentInfo: Send + Sync {
    /// Number of logical processors available to this process.
    fn processor_count(&self) -> usize;
}

/// [`EnvironmentInfo`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl EnvironmentInfo for SystemEnvironment {
    fn processor_count(&self) -> usize {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new()),
        );
        match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}
