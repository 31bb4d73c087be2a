//! Parent process watchdog.
//!
//! A peer must not outlive the host that started it, even when the host is
//! killed without a chance to clean up.

use peerhost::platform::is_process_alive;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Resolve once `pid` is no longer running.
pub async fn wait_for_parent_exit(pid: u32) {
    wait_with_interval(pid, POLL_INTERVAL).await
}

async fn wait_with_interval(pid: u32, interval: Duration) {
    debug!("Watching parent process {}", pid);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !is_process_alive(pid) {
            warn!("Parent process {} exited", pid);
            return;
        }
    }
}
