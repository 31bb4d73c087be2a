//! Entry gate that lets in-flight work finish before a peer is replaced.
//!
//! Callers bracket each use of a peer with [`BlockDrainer::enter`] and
//! [`BlockDrainer::exit`]. [`BlockDrainer::drain_and_block_entry`] closes the
//! gate and resolves once every entered caller has exited. New callers wait at
//! the gate until [`BlockDrainer::reset_after_draining`] reopens it.

use crate::error::{PeerError, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Counter-and-gate for graceful peer replacement.
///
/// The in-flight count is biased by -1 while draining, so the exit that
/// brings it to -1 is the one that completes the drain.
#[derive(Debug)]
pub struct BlockDrainer {
    count: AtomicI64,
    draining: AtomicBool,
    gate: Semaphore,
    completion: Mutex<Arc<Notify>>,
}

impl Default for BlockDrainer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDrainer {
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            gate: Semaphore::new(1),
            completion: Mutex::new(Arc::new(Notify::new())),
        }
    }

    fn completion(&self) -> Arc<Notify> {
        Arc::clone(&self.completion.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register an in-flight caller, waiting while a drain is in progress.
    pub async fn enter(&self) -> Result<()> {
        // Count while holding the gate so a drain that acquires it next
        // already sees this caller.
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| PeerError::InvalidState("drain gate closed".to_string()))?;
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Like [`enter`](Self::enter), returning a guard that exits on drop.
    pub async fn enter_guarded(&self) -> Result<DrainGuard<'_>> {
        self.enter().await?;
        Ok(DrainGuard { drainer: self })
    }

    /// Unregister an in-flight caller.
    ///
    /// Fails with `InvalidState` when there is no matching `enter`.
    pub fn exit(&self) -> Result<()> {
        let remaining = self.count.fetch_sub(1, Ordering::SeqCst) - 1;

        if remaining == -1 && self.draining.load(Ordering::SeqCst) {
            self.completion().notify_one();
            return Ok(());
        }
        if remaining < 0 {
            self.count.fetch_add(1, Ordering::SeqCst);
            return Err(PeerError::InvalidState(
                "exit called without a matching enter".to_string(),
            ));
        }
        Ok(())
    }

    /// Block new entries and wait for every in-flight caller to exit.
    pub async fn drain_and_block_entry(&self) -> Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| PeerError::InvalidState("drain gate closed".to_string()))?;
        permit.forget();

        let completion = self.completion();
        self.draining.store(true, Ordering::SeqCst);
        let in_flight = self.count.fetch_sub(1, Ordering::SeqCst);
        if in_flight > 0 {
            let pending = PendingDrain {
                drainer: self,
                armed: true,
            };
            completion.notified().await;
            pending.disarm();
        }
        Ok(())
    }

    /// Undo a drain that was dropped before completing.
    fn abandon_drain(&self) {
        // Remove the bias before clearing the flag, so a concurrent exit
        // never sees -1 without a drain in progress.
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.completion.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(Notify::new());
        self.draining.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
    }

    /// Reopen the gate after a completed drain.
    pub fn reset_after_draining(&self) -> Result<()> {
        if !self.draining.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidState(
                "reset_after_draining called without a drain".to_string(),
            ));
        }

        *self.completion.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(Notify::new());
        self.count.store(0, Ordering::SeqCst);
        self.draining.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
        Ok(())
    }

    /// Callers currently between `enter` and `exit`.
    pub fn in_flight(&self) -> i64 {
        let count = self.count.load(Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            count + 1
        } else {
            count
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Exits the drainer on drop.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    drainer: &'a BlockDrainer,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.drainer.exit() {
            warn!("Drain guard released twice: {}", e);
        }
    }
}

/// Reopens the gate if a drain future is dropped while still waiting.
struct PendingDrain<'a> {
    drainer: &'a BlockDrainer,
    armed: bool,
}

impl PendingDrain<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingDrain<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Drain abandoned before completion, reopening entry");
            self.drainer.abandon_drain();
        }
    }
}
