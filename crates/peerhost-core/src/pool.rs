//! Round-robin pool of invocation pipelines.

use crate::cancel::CancellationToken;
use crate::error::{PeerError, Result};
use crate::pipeline::InvocationPipeline;
use crate::request::InvocationRequest;
use crate::service::InvocationService;
use crate::transport::ByteStream;
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Spreads invocations over several peers, one pipeline per peer.
///
/// Selection is a lock-free counter modulo the pool size. The counter wraps
/// at `usize::MAX`, so the distribution is only uneven across that boundary.
#[derive(Debug)]
pub struct ProcessPool {
    pipelines: Box<[InvocationPipeline]>,
    next: AtomicUsize,
}

impl ProcessPool {
    pub fn new(pipelines: Vec<InvocationPipeline>) -> Result<Self> {
        if pipelines.is_empty() {
            return Err(PeerError::argument(
                "pipelines",
                "a process pool needs at least one pipeline",
            ));
        }
        info!("Created process pool with {} peers", pipelines.len());
        Ok(Self {
            pipelines: pipelines.into_boxed_slice(),
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.pipelines.len()
    }

    pub fn pipelines(&self) -> &[InvocationPipeline] {
        &self.pipelines
    }

    fn select(&self) -> &InvocationPipeline {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pipelines.len();
        &self.pipelines[index]
    }
}

#[async_trait]
impl InvocationService for ProcessPool {
    async fn invoke<T>(&self, request: InvocationRequest, cancel: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.select().invoke(request, cancel).await
    }

    async fn try_invoke<T>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.select().try_invoke(request, cancel).await
    }

    async fn invoke_stream(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.select().invoke_stream(request, cancel).await
    }

    async fn invoke_void(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.select().invoke_void(request, cancel).await
    }

    async fn replace_peer(&self) -> Result<()> {
        join_all(self.pipelines.iter().map(|pipeline| pipeline.replace_peer()))
            .await
            .into_iter()
            .collect()
    }

    async fn dispose(&self) {
        join_all(self.pipelines.iter().map(|pipeline| pipeline.dispose())).await;
    }
}
