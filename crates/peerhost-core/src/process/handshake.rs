//! Handshake parsing and peer output forwarding.
//!
//! A peer announces itself with a single stdout line:
//!
//! ```text
//! [peerhost] Listening on IP:127.0.0.1 Port:53821
//! ```
//!
//! Every other line is forwarded to tracing under the `peerhost::peer` target.

use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use regex::Regex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

static HANDSHAKE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{} Listening on IP:(?P<address>\S+) Port:(?P<port>\d+)\s*$",
        regex::escape(PeerConfig::HANDSHAKE_MARKER)
    ))
    .unwrap()
});

/// Diagnostics printed by runtime debuggers that are not worth an error log.
const BENIGN_DIAGNOSTICS: &[&str] = &[
    "Debugger listening on",
    "Debugger attached.",
    "For help, see:",
    "Waiting for the debugger to disconnect...",
];

/// Address of a connected peer.
///
/// The generation distinguishes successive peers of one supervisor, so a
/// stale endpoint can never discard its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    generation: u64,
    addr: SocketAddr,
    url: Url,
}

impl PeerEndpoint {
    pub fn new(generation: u64, addr: SocketAddr) -> Result<Self> {
        let url = Url::parse(&format!("http://{}/", addr)).map_err(|e| PeerError::Protocol {
            status: 0,
            message: format!("Peer announced an unusable address {}: {}", addr, e),
        })?;
        Ok(Self {
            generation,
            addr,
            url,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Parse a handshake line into the peer's socket address.
pub fn parse_handshake_line(line: &str) -> Option<SocketAddr> {
    let captures = HANDSHAKE_LINE.captures(line)?;
    let address = captures["address"].trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = address.parse().ok()?;
    let port: u16 = captures["port"].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Whether a stderr line is debugger chatter rather than a real error.
pub fn is_benign_diagnostic(line: &str) -> bool {
    BENIGN_DIAGNOSTICS.iter().any(|prefix| line.starts_with(prefix))
}

/// Read peer stdout until it closes.
///
/// The first handshake line is sent on `handshake`; later handshake lines and
/// all other output are logged.
pub(crate) async fn forward_stdout<R>(stdout: R, pid: u32, handshake: oneshot::Sender<SocketAddr>)
where
    R: AsyncRead + Unpin,
{
    let mut handshake = Some(handshake);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if handshake.is_some() {
                    if let Some(addr) = parse_handshake_line(&line) {
                        debug!("Peer {} announced {}", pid, addr);
                        if let Some(tx) = handshake.take() {
                            // The receiver is gone when startup already timed out.
                            let _ = tx.send(addr);
                        }
                        continue;
                    }
                }
                info!(target: "peerhost::peer", pid, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdout of peer {}: {}", pid, e);
                break;
            }
        }
    }
    debug!("Stdout of peer {} closed", pid);
}

/// Read peer stderr until it closes.
pub(crate) async fn forward_stderr<R>(stderr: R, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_benign_diagnostic(&line) => {
                debug!(target: "peerhost::peer", pid, "{}", line);
            }
            Ok(Some(line)) => error!(target: "peerhost::peer", pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stderr of peer {}: {}", pid, e);
                break;
            }
        }
    }
}
