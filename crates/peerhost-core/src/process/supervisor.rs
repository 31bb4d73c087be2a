//! Peer process supervision.
//!
//! A [`ProcessSupervisor`] owns at most one live peer. Peers are started
//! lazily on the first call to [`PeerProvider::ensure_live_peer`], and a dead
//! peer is replaced on the next call. Each child is owned by a monitor task
//! that reaps it, so exits are observed without polling.

use super::handshake::{forward_stderr, forward_stdout, PeerEndpoint};
use super::launcher::{spawn_failure, ProcessSpawner, SpawnSpec, TokioSpawner};
use crate::config::{PeerConfig, ProcessOptions};
use crate::error::{PeerError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of one peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Spawned, handshake not seen yet.
    Starting,
    /// Handshake seen; accepting invocations.
    Connected,
    /// Kill requested.
    Dying,
    /// Exited and reaped.
    Dead,
}

/// Source of live peers for an invocation pipeline.
#[async_trait]
pub trait PeerProvider: Send + Sync {
    /// Return the endpoint of a connected peer, starting one if needed.
    ///
    /// Concurrent callers share a single start attempt.
    async fn ensure_live_peer(&self) -> Result<PeerEndpoint>;

    /// Kill the peer behind `endpoint` if it is still the current one.
    async fn discard(&self, endpoint: &PeerEndpoint);

    /// Kill the current peer and wait for it to exit. The next
    /// `ensure_live_peer` starts a fresh one.
    async fn retire(&self);

    /// Retire the current peer and refuse to start new ones.
    async fn dispose(&self);

    /// OS process id of the current peer.
    fn current_pid(&self) -> Option<u32> {
        None
    }
}

/// A started peer process.
#[derive(Debug)]
pub struct PeerProcess {
    endpoint: PeerEndpoint,
    pid: Option<u32>,
    state: Arc<watch::Sender<PeerState>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerProcess {
    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Request the kill. Idempotent.
    pub fn kill(&self) {
        self.state.send_if_modified(|state| match state {
            PeerState::Starting | PeerState::Connected => {
                *state = PeerState::Dying;
                true
            }
            _ => false,
        });
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The monitor is gone when the process already exited.
            let _ = sender.send(());
        }
    }

    /// Wait until the process has been reaped. Returns false on timeout.
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut state = self.state.subscribe();
        let exited = tokio::time::timeout(limit, state.wait_for(|s| *s == PeerState::Dead)).await;
        matches!(exited, Ok(Ok(_)))
    }

    /// Kill, wait for exit, then let the output readers flush.
    async fn shutdown(&self) {
        self.kill();
        if !self.wait_for_exit(PeerConfig::OUTPUT_FLUSH_TIMEOUT).await {
            warn!(
                "Peer process {:?} did not exit within {:?}",
                self.pid,
                PeerConfig::OUTPUT_FLUSH_TIMEOUT
            );
        }

        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for reader in readers {
            if tokio::time::timeout(PeerConfig::OUTPUT_FLUSH_TIMEOUT, reader)
                .await
                .is_err()
            {
                debug!("Output of peer {:?} did not flush in time", self.pid);
            }
        }
    }
}

/// Starts, tracks and replaces the peer for one pipeline.
pub struct ProcessSupervisor {
    options: ProcessOptions,
    connection_timeout: Option<Duration>,
    spawner: Arc<dyn ProcessSpawner>,
    current: RwLock<Option<Arc<PeerProcess>>>,
    creation_gate: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    disposed: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor. No process is started until the first call to
    /// [`PeerProvider::ensure_live_peer`].
    pub fn new(options: ProcessOptions, connection_timeout: Option<Duration>) -> Self {
        Self {
            options,
            connection_timeout,
            spawner: Arc::new(TokioSpawner),
            current: RwLock::new(None),
            creation_gate: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Use a custom spawner.
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// The current peer, live or not.
    pub fn current(&self) -> Option<Arc<PeerProcess>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live_endpoint(&self) -> Option<PeerEndpoint> {
        self.current()
            .filter(|peer| peer.is_alive())
            .map(|peer| peer.endpoint().clone())
    }

    fn take_current(&self) -> Option<Arc<PeerProcess>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(PeerError::InvalidState(
                "the peer supervisor has been disposed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn start_peer(&self) -> Result<Arc<PeerProcess>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = SpawnSpec::from_options(&self.options, std::process::id());

        let mut child = self
            .spawner
            .spawn(&spec)
            .map_err(|e| spawn_failure(&spec, e))?;
        let pid = child.id();
        let log_pid = pid.unwrap_or_default();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(PeerError::ProcessSpawnFailure {
                    executable: spec.program.clone(),
                    message: "the spawner must capture stdout and stderr".to_string(),
                    source: None,
                });
            }
        };

        info!(
            "Started peer process {} (generation {}): {}",
            log_pid,
            generation,
            spec.command_line()
        );

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let readers = vec![
            tokio::spawn(forward_stdout(stdout, log_pid, handshake_tx)),
            tokio::spawn(forward_stderr(stderr, log_pid)),
        ];

        let (state, _) = watch::channel(PeerState::Starting);
        let state = Arc::new(state);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor_process(child, log_pid, Arc::clone(&state), kill_rx));

        let announced = match self.connection_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake_rx).await {
                Ok(announced) => announced,
                Err(_) => {
                    warn!(
                        "Peer process {} did not announce its endpoint within {:?}, killing it",
                        log_pid, limit
                    );
                    let _ = kill_tx.send(());
                    return Err(PeerError::ConnectionTimeout(limit));
                }
            },
            None => handshake_rx.await,
        };

        let exited_early = || PeerError::ProcessSpawnFailure {
            executable: spec.program.clone(),
            message: format!(
                "the process exited before announcing its endpoint; its output is logged \
                 under the `{}` target. Command: {}",
                PeerConfig::LOG_TARGET,
                spec.command_line()
            ),
            source: None,
        };

        let Ok(addr) = announced else {
            let _ = kill_tx.send(());
            return Err(exited_early());
        };
        let endpoint = match PeerEndpoint::new(generation, addr) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = kill_tx.send(());
                return Err(e);
            }
        };

        let connected = state.send_if_modified(|s| {
            if *s == PeerState::Starting {
                *s = PeerState::Connected;
                true
            } else {
                false
            }
        });
        if !connected {
            return Err(exited_early());
        }

        info!("Connected to peer {} at {}", log_pid, endpoint);
        Ok(Arc::new(PeerProcess {
            endpoint,
            pid,
            state,
            kill: Mutex::new(Some(kill_tx)),
            readers: Mutex::new(readers),
        }))
    }
}

#[async_trait]
impl PeerProvider for ProcessSupervisor {
    async fn ensure_live_peer(&self) -> Result<PeerEndpoint> {
        self.check_not_disposed()?;
        if let Some(endpoint) = self.live_endpoint() {
            return Ok(endpoint);
        }

        let _gate = self.creation_gate.lock().await;
        if let Some(endpoint) = self.live_endpoint() {
            return Ok(endpoint);
        }
        self.check_not_disposed()?;

        if let Some(stale) = self.take_current() {
            debug!(
                "Replacing peer {} ({:?})",
                stale.endpoint(),
                stale.state()
            );
            stale.kill();
        }

        let peer = self.start_peer().await?;
        if self.disposed.load(Ordering::SeqCst) {
            peer.kill();
            return Err(PeerError::InvalidState(
                "the peer supervisor was disposed while a peer was starting".to_string(),
            ));
        }

        let endpoint = peer.endpoint().clone();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        Ok(endpoint)
    }

    async fn discard(&self, endpoint: &PeerEndpoint) {
        let stale = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let matches = current
                .as_ref()
                .is_some_and(|peer| peer.endpoint().generation() == endpoint.generation());
            if matches {
                current.take()
            } else {
                None
            }
        };

        if let Some(peer) = stale {
            warn!("Discarding unreachable peer {}", endpoint);
            peer.kill();
        }
    }

    async fn retire(&self) {
        if let Some(peer) = self.take_current() {
            info!("Retiring peer {}", peer.endpoint());
            peer.shutdown().await;
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.retire().await;
    }

    fn current_pid(&self) -> Option<u32> {
        self.current()
            .filter(|peer| peer.state() != PeerState::Dead)
            .and_then(|peer| peer.pid())
    }
}

/// Own the child until it exits or a kill is requested.
///
/// Dropping the kill sender also kills the child.
async fn monitor_process(
    mut child: Child,
    pid: u32,
    state: Arc<watch::Sender<PeerState>>,
    kill: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            let retired = *state.borrow() == PeerState::Dying;
            match status {
                Ok(status) if retired => debug!("Peer process {} exited: {}", pid, status),
                Ok(status) => warn!("Peer process {} exited unexpectedly: {}", pid, status),
                Err(e) => warn!("Failed to wait for peer process {}: {}", pid, e),
            }
        }
        _ = kill => {
            debug!("Killing peer process {}", pid);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill peer process {}: {}", pid, e);
            }
        }
    }
    state.send_replace(PeerState::Dead);
}
