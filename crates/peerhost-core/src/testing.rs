//! In-memory peers for pipeline and pool tests.

use crate::error::{PeerError, Result};
use crate::process::{PeerEndpoint, PeerProvider};
use crate::transport::{Transport, TransportError, WireRequest, WireResponse};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Provider whose "peer" is just a generation number.
pub(crate) struct FakeProvider {
    generation: AtomicU64,
    discarded: AtomicUsize,
    retired: AtomicUsize,
    disposed: AtomicBool,
    reconnect_delay: Option<Duration>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU64::new(1),
            discarded: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            reconnect_delay: None,
        }
    }

    /// Delay every peer acquisition after the first generation.
    pub(crate) fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub(crate) fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    pub(crate) fn retired(&self) -> usize {
        self.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerProvider for FakeProvider {
    async fn ensure_live_peer(&self) -> Result<PeerEndpoint> {
        if self.is_disposed() {
            return Err(PeerError::InvalidState("disposed".to_string()));
        }
        let generation = self.generation.load(Ordering::SeqCst);
        if generation > 1 {
            if let Some(delay) = self.reconnect_delay {
                tokio::time::sleep(delay).await;
            }
        }
        let addr: SocketAddr = ([127, 0, 0, 1], 9).into();
        PeerEndpoint::new(generation, addr)
    }

    async fn discard(&self, endpoint: &PeerEndpoint) {
        let current = endpoint.generation();
        if self
            .generation
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn retire(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.retired.fetch_add(1, Ordering::SeqCst);
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// What the scripted peer does with a request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Respond {
        status: u16,
        content_type: Option<&'static str>,
        body: &'static str,
    },
    Unavailable,
    Hang,
    /// Answer `text/plain` after a delay.
    Slow(Duration, &'static str),
}

impl Reply {
    pub(crate) fn ok(content_type: &'static str, body: &'static str) -> Self {
        Reply::Respond {
            status: 200,
            content_type: Some(content_type),
            body,
        }
    }

    pub(crate) fn status(status: u16, body: &'static str) -> Self {
        Reply::Respond {
            status,
            content_type: Some("application/json"),
            body,
        }
    }
}

type Script = Box<dyn Fn(u64, usize) -> Reply + Send + Sync>;

/// Transport that answers from a script keyed by peer generation and call index.
pub(crate) struct ScriptedTransport {
    script: Script,
    calls: Mutex<Vec<(u64, Bytes)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: impl Fn(u64, usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn generations(&self) -> Vec<u64> {
        self.calls.lock().unwrap().iter().map(|(g, _)| *g).collect()
    }

    pub(crate) fn bodies(&self) -> Vec<Bytes> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        endpoint: &PeerEndpoint,
        request: WireRequest,
    ) -> std::result::Result<WireResponse, TransportError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((endpoint.generation(), request.body));
            calls.len() - 1
        };

        match (self.script)(endpoint.generation(), index) {
            Reply::Respond {
                status,
                content_type,
                body,
            } => Ok(WireResponse::from_bytes(status, content_type, body)),
            Reply::Unavailable => Err(TransportError::Unavailable(
                "connection refused".to_string(),
            )),
            Reply::Hang => std::future::pending().await,
            Reply::Slow(delay, body) => {
                tokio::time::sleep(delay).await;
                Ok(WireResponse::from_bytes(200, Some("text/plain"), body))
            }
        }
    }
}
