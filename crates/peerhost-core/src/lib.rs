//! peerhost - supervised out-of-process script peers.
//!
//! A host application invokes functions in long-lived peer processes (a
//! JavaScript runtime, a script interpreter, anything that speaks the peer
//! protocol) as if they were local async calls. The library starts peers
//! lazily, reads their endpoint from a stdout handshake, restarts them when
//! they die, retries once when a peer disappears mid-call, enforces
//! invocation timeouts, and can replace peers when watched source files
//! change.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerhost::{CancellationToken, InvocationService, PeerHost, PeerHostOptions, ProcessOptions};
//!
//! #[tokio::main]
//! async fn main() -> peerhost::Result<()> {
//!     let mut options = PeerHostOptions::default();
//!     options.process = ProcessOptions::new("peerhost-peer");
//!     let host = PeerHost::new(options)?;
//!
//!     let cancel = CancellationToken::new();
//!     let sum: i64 = host
//!         .invoke_from_string("fn add(a, b) { a + b }", None, Some("add"), vec![1.into(), 2.into()], &cancel)
//!         .await?;
//!     println!("1 + 2 = {}", sum);
//!
//!     host.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod codec;
pub mod config;
pub mod drainer;
pub mod error;
pub mod pipeline;
pub mod platform;
pub mod pool;
pub mod process;
pub mod request;
pub mod service;
pub mod transport;
pub mod watcher;

mod api;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use codec::{JsonCodec, SerdeJsonCodec};
pub use config::{
    Concurrency, HttpOptions, HttpVersion, PeerHostOptions, ProcessOptions, ServiceOptions,
};
pub use drainer::{BlockDrainer, DrainGuard};
pub use error::{PeerError, Result};
pub use pipeline::{InvocationPipeline, PipelineSettings};
pub use pool::ProcessPool;
pub use process::{PeerEndpoint, PeerProvider, ProcessSpawner, ProcessSupervisor};
pub use request::{InvocationMetadata, InvocationRequest, ModuleSourceKind, StreamSource};
pub use service::InvocationService;
pub use transport::{ByteStream, HttpTransport, Transport, TransportError};
pub use watcher::FileWatchCoordinator;

pub use api::PeerHostBuilder;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// Entry point: one supervised peer, or a round-robin pool of them.
#[derive(Debug)]
pub enum PeerHost {
    Single(InvocationPipeline),
    Pool(ProcessPool),
}

impl PeerHost {
    /// Start configuring a host.
    pub fn builder(options: PeerHostOptions) -> PeerHostBuilder {
        PeerHostBuilder::new(options)
    }

    /// Build a host with default seams.
    pub fn new(options: PeerHostOptions) -> Result<Self> {
        Self::builder(options).build()
    }

    /// Number of peers this host runs.
    pub fn peer_count(&self) -> usize {
        match self {
            PeerHost::Single(_) => 1,
            PeerHost::Pool(pool) => pool.size(),
        }
    }

    /// Process ids of the peers that are currently running.
    pub fn peer_pids(&self) -> Vec<u32> {
        match self {
            PeerHost::Single(pipeline) => pipeline.peer_pid().into_iter().collect(),
            PeerHost::Pool(pool) => pool
                .pipelines()
                .iter()
                .filter_map(InvocationPipeline::peer_pid)
                .collect(),
        }
    }
}

#[async_trait]
impl InvocationService for PeerHost {
    async fn invoke<T>(&self, request: InvocationRequest, cancel: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self {
            PeerHost::Single(pipeline) => pipeline.invoke(request, cancel).await,
            PeerHost::Pool(pool) => pool.invoke(request, cancel).await,
        }
    }

    async fn try_invoke<T>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self {
            PeerHost::Single(pipeline) => pipeline.try_invoke(request, cancel).await,
            PeerHost::Pool(pool) => pool.try_invoke(request, cancel).await,
        }
    }

    async fn invoke_stream(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        match self {
            PeerHost::Single(pipeline) => pipeline.invoke_stream(request, cancel).await,
            PeerHost::Pool(pool) => pool.invoke_stream(request, cancel).await,
        }
    }

    async fn invoke_void(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            PeerHost::Single(pipeline) => pipeline.invoke_void(request, cancel).await,
            PeerHost::Pool(pool) => pool.invoke_void(request, cancel).await,
        }
    }

    async fn replace_peer(&self) -> Result<()> {
        match self {
            PeerHost::Single(pipeline) => pipeline.replace_peer().await,
            PeerHost::Pool(pool) => pool.replace_peer().await,
        }
    }

    async fn dispose(&self) {
        match self {
            PeerHost::Single(pipeline) => pipeline.dispose().await,
            PeerHost::Pool(pool) => pool.dispose().await,
        }
    }
}
