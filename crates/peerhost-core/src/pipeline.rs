//! Invocation pipeline for a single supervised peer.
//!
//! Each invocation acquires a live peer, sends the encoded request under the
//! invocation timeout, retries once on a fresh peer if the current one turns
//! out to be unreachable, and maps the response to a result or a typed error.
//! With graceful shutdown enabled, peer replacement waits for in-flight
//! invocations through a [`BlockDrainer`].

use crate::cancel::CancellationToken;
use crate::codec::{decode_typed, from_value, JsonCodec};
use crate::config::InvocationConfig;
use crate::drainer::BlockDrainer;
use crate::error::{PeerError, Result};
use crate::process::{PeerEndpoint, PeerProvider};
use crate::request::InvocationRequest;
use crate::service::InvocationService;
use crate::transport::{ByteStream, Transport, TransportError};
use crate::watcher::FileWatchCoordinator;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const PHASE_CONNECTING: u8 = 0;
const PHASE_AWAITING_RESPONSE: u8 = 1;

/// Longest peer response body quoted in a protocol error.
const MAX_BODY_EXCERPT: usize = 512;

/// Pipeline behaviour that is not part of the peer or transport.
#[derive(Default)]
pub struct PipelineSettings {
    /// Round-trip limit. `None` waits indefinitely.
    pub invocation_timeout: Option<Duration>,
    /// Drain in-flight invocations before replacing the peer.
    pub graceful_shutdown: bool,
    /// Replace the peer when watched files change.
    pub watcher: Option<FileWatchCoordinator>,
}

/// Runs invocations against one supervised peer.
///
/// Cloning is cheap; clones share the peer.
#[derive(Clone)]
pub struct InvocationPipeline {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for InvocationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationPipeline")
            .field("peer_pid", &self.peer_pid())
            .field("invocation_timeout", &self.inner.invocation_timeout)
            .field("graceful_shutdown", &self.inner.graceful_shutdown)
            .field("watching", &self.is_watching())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

struct PipelineInner {
    provider: Arc<dyn PeerProvider>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn JsonCodec>,
    invocation_timeout: Option<Duration>,
    graceful_shutdown: bool,
    drainer: BlockDrainer,
    watcher: Option<FileWatchCoordinator>,
    watching: AtomicBool,
    watch_registration: Mutex<()>,
    disposed: AtomicBool,
}

/// Successful response body, before decoding.
enum Payload {
    Text(String),
    Json(Bytes),
    Stream(ByteStream),
    Empty,
}

/// Response as received, with everything but octet streams buffered.
enum Received {
    Stream(ByteStream),
    Buffered {
        status: u16,
        media_type: Option<String>,
        body: Bytes,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerErrorBody {
    error_message: String,
    #[serde(default)]
    error_stack: Option<String>,
}

impl InvocationPipeline {
    pub fn new(
        provider: Arc<dyn PeerProvider>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn JsonCodec>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                provider,
                transport,
                codec,
                invocation_timeout: settings.invocation_timeout,
                graceful_shutdown: settings.graceful_shutdown,
                drainer: BlockDrainer::new(),
                watcher: settings.watcher,
                watching: AtomicBool::new(false),
                watch_registration: Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// OS process id of the current peer, if one is running.
    pub fn peer_pid(&self) -> Option<u32> {
        self.inner.provider.current_pid()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Whether a file watch has been registered for this pipeline.
    pub fn is_watching(&self) -> bool {
        self.inner.watching.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
        accept_not_found: bool,
    ) -> Result<Option<Payload>> {
        self.inner.check_not_disposed()?;
        self.ensure_watching()?;
        self.inner.execute(request, cancel, accept_not_found).await
    }

    /// Register the file-change listener on first use.
    ///
    /// The listener holds a weak reference so a dropped pipeline is not kept
    /// alive by its watcher.
    fn ensure_watching(&self) -> Result<()> {
        let Some(watcher) = self.inner.watcher.as_ref() else {
            return Ok(());
        };
        if self.inner.watching.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _registration = self
            .inner
            .watch_registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.watching.load(Ordering::SeqCst) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            PeerError::InvalidState(format!("file watching needs a tokio runtime: {}", e))
        })?;
        let pipeline = Arc::downgrade(&self.inner);
        watcher.add_listener(Arc::new(move |path: &Path| {
            let Some(inner) = pipeline.upgrade() else {
                return;
            };
            info!("{} changed, replacing peer", path.display());
            runtime.spawn(async move {
                if let Err(e) = inner.replace_peer().await {
                    warn!("Failed to replace peer after a file change: {}", e);
                }
            });
        }))?;

        self.inner.watching.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn decode<T: DeserializeOwned>(&self, payload: Payload) -> Result<T> {
        match payload {
            Payload::Text(text) => from_value(Value::String(text)),
            Payload::Json(body) => decode_typed(self.inner.codec.as_ref(), &body),
            Payload::Empty => from_value(Value::Null),
            Payload::Stream(_) => Err(PeerError::Protocol {
                status: 200,
                message: "the peer returned a byte stream; use invoke_stream for this call"
                    .to_string(),
            }),
        }
    }
}

impl PipelineInner {
    fn check_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(PeerError::InvalidState(
                "the invocation pipeline has been disposed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        mut request: InvocationRequest,
        cancel: &CancellationToken,
        accept_not_found: bool,
    ) -> Result<Option<Payload>> {
        cancel.check()?;

        let _guard = if self.graceful_shutdown {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                guard = self.drainer.enter_guarded() => Some(guard?),
            }
        } else {
            None
        };

        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            endpoint = self.provider.ensure_live_peer() => endpoint?,
        };

        let phase = AtomicU8::new(PHASE_AWAITING_RESPONSE);
        let exchange = self.exchange(endpoint, &mut request, accept_not_found, &phase);

        match self.invocation_timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Err(PeerError::Cancelled),
                result = tokio::time::timeout(limit, exchange) => match result {
                    Ok(result) => result,
                    Err(_) => Err(timeout_error(limit, phase.load(Ordering::SeqCst))),
                },
            },
            None => tokio::select! {
                _ = cancel.cancelled() => Err(PeerError::Cancelled),
                result = exchange => result,
            },
        }
    }

    /// Send the request, retrying once on a fresh peer if the first one is
    /// unreachable.
    async fn exchange(
        &self,
        mut endpoint: PeerEndpoint,
        request: &mut InvocationRequest,
        accept_not_found: bool,
        phase: &AtomicU8,
    ) -> Result<Option<Payload>> {
        let mut retried = false;
        loop {
            let wire = request.encode(self.codec.as_ref()).await?;
            match self.round_trip(&endpoint, wire).await {
                Ok(received) => return self.classify(received, accept_not_found),
                Err(TransportError::Unavailable(message)) if !retried => {
                    warn!(
                        "Peer {} is unreachable ({}), retrying on a fresh peer",
                        endpoint, message
                    );
                    retried = true;
                    self.provider.discard(&endpoint).await;
                    phase.store(PHASE_CONNECTING, Ordering::SeqCst);
                    endpoint = self.provider.ensure_live_peer().await?;
                    phase.store(PHASE_AWAITING_RESPONSE, Ordering::SeqCst);
                }
                Err(TransportError::Unavailable(message)) => {
                    return Err(PeerError::PeerUnavailable {
                        endpoint: endpoint.to_string(),
                        message,
                    })
                }
                Err(TransportError::Failed(message)) => {
                    return Err(PeerError::Protocol { status: 0, message })
                }
            }
        }
    }

    async fn round_trip(
        &self,
        endpoint: &PeerEndpoint,
        wire: crate::transport::WireRequest,
    ) -> std::result::Result<Received, TransportError> {
        let response = self.transport.send(endpoint, wire).await?;
        let media_type = response.media_type();
        debug!("Peer {} responded {} ({:?})", endpoint, response.status, media_type);

        if response.status == 200
            && media_type.as_deref() == Some(InvocationConfig::CONTENT_TYPE_OCTET_STREAM)
        {
            return Ok(Received::Stream(response.body));
        }

        let status = response.status;
        let body = response.collect().await?;
        Ok(Received::Buffered {
            status,
            media_type,
            body,
        })
    }

    fn classify(&self, received: Received, accept_not_found: bool) -> Result<Option<Payload>> {
        let (status, media_type, body) = match received {
            Received::Stream(body) => return Ok(Some(Payload::Stream(body))),
            Received::Buffered {
                status,
                media_type,
                body,
            } => (status, media_type, body),
        };

        match status {
            200 => {
                let payload = if media_type.as_deref() == Some(InvocationConfig::CONTENT_TYPE_TEXT) {
                    let text = String::from_utf8(body.to_vec()).map_err(|e| PeerError::Protocol {
                        status,
                        message: format!("text result is not valid UTF-8: {}", e),
                    })?;
                    Payload::Text(text)
                } else if body.is_empty() {
                    Payload::Empty
                } else {
                    Payload::Json(body)
                };
                Ok(Some(payload))
            }
            404 if accept_not_found => Ok(None),
            404 => Err(PeerError::Protocol {
                status,
                message: format!(
                    "the peer has no cached module for this request; use try_invoke for \
                     cache lookups ({})",
                    body_excerpt(&body)
                ),
            }),
            500 => Err(self.peer_error(&body)),
            _ => Err(PeerError::Protocol {
                status,
                message: body_excerpt(&body),
            }),
        }
    }

    fn peer_error(&self, body: &[u8]) -> PeerError {
        match decode_typed::<PeerErrorBody>(self.codec.as_ref(), body) {
            Ok(error) => PeerError::Invocation {
                message: error.error_message,
                peer_stack: error.error_stack,
            },
            Err(_) => PeerError::Protocol {
                status: 500,
                message: body_excerpt(body),
            },
        }
    }

    /// Retire the current peer, draining first in graceful mode.
    ///
    /// The graceful path runs on its own task so the gate is reopened even
    /// when the caller stops waiting.
    async fn replace_peer(self: &Arc<Self>) -> Result<()> {
        if !self.graceful_shutdown {
            self.provider.retire().await;
            return Ok(());
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.drainer.drain_and_block_entry().await?;
            inner.provider.retire().await;
            inner.drainer.reset_after_draining()
        })
        .await
        .map_err(|e| PeerError::InvalidState(format!("peer replacement task failed: {}", e)))?
    }
}

fn timeout_error(limit: Duration, phase: u8) -> PeerError {
    let message = if phase == PHASE_CONNECTING {
        format!(
            "The invocation timed out after {}ms before a connection to a replacement peer \
             was established. The peer may be failing during startup; check its output in \
             the log, or raise `invocation_timeout_ms`.",
            limit.as_millis()
        )
    } else {
        format!(
            "The invocation timed out after {}ms: the peer accepted the request but never \
             responded. Make sure the invoked function always completes (a callback-style \
             function must eventually invoke its callback). Raise `invocation_timeout_ms` \
             if the function legitimately needs longer, or set it to 0 to wait indefinitely.",
            limit.as_millis()
        )
    };
    PeerError::InvocationTimeout {
        message,
        timeout: limit,
    }
}

fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_BODY_EXCERPT {
        return text.into_owned();
    }
    let mut excerpt: String = text.chars().take(MAX_BODY_EXCERPT).collect();
    excerpt.push_str("...");
    excerpt
}

fn payload_stream(payload: Payload) -> ByteStream {
    match payload {
        Payload::Stream(body) => body,
        Payload::Text(text) => Box::pin(stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from(text))
        })),
        Payload::Json(body) => Box::pin(stream::once(async move {
            Ok::<_, std::io::Error>(body)
        })),
        Payload::Empty => Box::pin(stream::empty()),
    }
}

#[async_trait]
impl InvocationService for InvocationPipeline {
    async fn invoke<T>(&self, request: InvocationRequest, cancel: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.execute(request, cancel, false).await? {
            Some(payload) => self.decode(payload),
            None => Err(PeerError::Protocol {
                status: 404,
                message: "the peer has no cached module for this request".to_string(),
            }),
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
        match self.execute(request, cancel, true).await? {
            Some(payload) => self.decode(payload).map(Some),
            None => Ok(None),
        }
    }

    async fn invoke_stream(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        match self.execute(request, cancel, false).await? {
            Some(payload) => Ok(payload_stream(payload)),
            None => Err(PeerError::Protocol {
                status: 404,
                message: "the peer has no cached module for this request".to_string(),
            }),
        }
    }

    async fn invoke_void(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.execute(request, cancel, false).await?;
        Ok(())
    }

    async fn replace_peer(&self) -> Result<()> {
        self.inner.check_not_disposed()?;
        self.inner.replace_peer().await
    }

    async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = &self.inner.watcher {
            watcher.stop();
        }
        self.inner.provider.dispose().await;
        debug!("Invocation pipeline disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerdeJsonCodec;
    use crate::request::StreamSource;
    use crate::testing::{FakeProvider, Reply, ScriptedTransport};
    use futures::StreamExt;
    use serde_json::json;
    use std::io::Cursor;
    use std::time::Instant;

    fn pipeline(
        provider: &Arc<FakeProvider>,
        transport: &Arc<ScriptedTransport>,
        timeout: Option<Duration>,
        graceful: bool,
    ) -> InvocationPipeline {
        InvocationPipeline::new(
            Arc::clone(provider) as Arc<dyn PeerProvider>,
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(SerdeJsonCodec),
            PipelineSettings {
                invocation_timeout: timeout,
                graceful_shutdown: graceful,
                watcher: None,
            },
        )
    }

    fn request() -> InvocationRequest {
        InvocationRequest::from_string("module").unwrap()
    }

    fn replying(reply: Reply) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(move |_, _| reply.clone()))
    }

    #[tokio::test]
    async fn test_text_result() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::ok("text/plain; charset=utf-8", "hello"));
        let pipeline = pipeline(&provider, &transport, None, false);

        let result: String = pipeline
            .invoke(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn test_json_result() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::ok("application/json", r#"{"sum":3}"#));
        let pipeline = pipeline(&provider, &transport, None, false);

        let result: Value = pipeline
            .invoke(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({ "sum": 3 }));
    }

    #[tokio::test]
    async fn test_empty_result() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::ok("application/json", ""));
        let pipeline = pipeline(&provider, &transport, None, false);

        let result: Option<u32> = pipeline
            .invoke(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, None);
        pipeline
            .invoke_void(request(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_error() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::status(
            500,
            r#"{"errorMessage":"x is undefined","errorStack":"at line 3"}"#,
        ));
        let pipeline = pipeline(&provider, &transport, None, false);

        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PeerError::Invocation {
                message,
                peer_stack,
            } => {
                assert_eq!(message, "x is undefined");
                assert_eq!(peer_stack.as_deref(), Some("at line 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_found() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::status(404, ""));
        let pipeline = pipeline(&provider, &transport, None, false);
        let cancel = CancellationToken::new();

        let cached = InvocationRequest::from_cache("k").unwrap();
        let result: Option<Value> = pipeline.try_invoke(cached, &cancel).await.unwrap();
        assert_eq!(result, None);

        let cached = InvocationRequest::from_cache("k").unwrap();
        let err = pipeline.invoke::<Value>(cached, &cancel).await.unwrap_err();
        assert!(matches!(err, PeerError::Protocol { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::status(418, "short and stout"));
        let pipeline = pipeline(&provider, &transport, None, false);

        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PeerError::Protocol { status, message } => {
                assert_eq!(status, 418);
                assert_eq!(message, "short and stout");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retries_once_on_fresh_peer() {
        let provider = Arc::new(FakeProvider::new());
        let transport = Arc::new(ScriptedTransport::new(|generation, _| {
            if generation == 1 {
                Reply::Unavailable
            } else {
                Reply::ok("text/plain", "recovered")
            }
        }));
        let pipeline = pipeline(&provider, &transport, None, false);

        let result: String = pipeline
            .invoke(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "recovered");
        assert_eq!(provider.discarded(), 1);
        assert_eq!(transport.generations(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_second_failure_is_peer_unavailable() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Unavailable);
        let pipeline = pipeline(&provider, &transport, None, false);

        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::PeerUnavailable { .. }), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(transport.generations(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retry_resends_stream_from_start() {
        let provider = Arc::new(FakeProvider::new());
        let transport = Arc::new(ScriptedTransport::new(|generation, _| {
            if generation == 1 {
                Reply::Unavailable
            } else {
                Reply::ok("application/json", "42")
            }
        }));
        let pipeline = pipeline(&provider, &transport, None, false);

        let stream = StreamSource::from_reader(Cursor::new(b"40 + 2".to_vec()));
        let result: i64 = pipeline
            .invoke(InvocationRequest::from_stream(stream), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, 42);

        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1]);
        assert!(bodies[1].ends_with(b"40 + 2"));
    }

    #[tokio::test]
    async fn test_timeout_while_awaiting_response() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Hang);
        let pipeline = pipeline(&provider, &transport, Some(Duration::from_millis(50)), false);

        let started = Instant::now();
        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(err.is_timeout());
        let message = err.to_string();
        assert!(message.contains("never responded"), "{message}");
        assert!(message.contains("invocation_timeout_ms"), "{message}");
    }

    #[tokio::test]
    async fn test_timeout_while_reconnecting() {
        let provider = Arc::new(FakeProvider::new().with_reconnect_delay(Duration::from_secs(10)));
        let transport = replying(Reply::Unavailable);
        let pipeline = pipeline(&provider, &transport, Some(Duration::from_millis(50)), false);

        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before a connection"), "{err}");
    }

    #[tokio::test]
    async fn test_cancellation() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Hang);
        let pipeline = pipeline(&provider, &transport, None, false);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = pipeline.invoke::<Value>(request(), &cancel).await.unwrap_err();
        assert!(matches!(err, PeerError::Cancelled));
        canceller.await.unwrap();

        let err = pipeline.invoke::<Value>(request(), &cancel).await.unwrap_err();
        assert!(matches!(err, PeerError::Cancelled));
    }

    #[tokio::test]
    async fn test_invoke_stream() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::ok("application/octet-stream", "\x00\x01binary"));
        let pipeline = pipeline(&provider, &transport, None, false);

        let mut body = pipeline
            .invoke_stream(request(), &CancellationToken::new())
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"\x00\x01binary");

        let err = pipeline
            .invoke::<Value>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Protocol { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_graceful_replace_waits_for_in_flight() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Slow(Duration::from_millis(300), "done"));
        let pipeline = pipeline(&provider, &transport, None, true);

        let invocation = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .invoke::<String>(request(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let replacement = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.replace_peer().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.retired(), 0);
        assert!(!replacement.is_finished());

        assert_eq!(invocation.await.unwrap().unwrap(), "done");
        replacement.await.unwrap().unwrap();
        assert_eq!(provider.retired(), 1);

        let result: String = pipeline
            .invoke(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(transport.generations(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_abandoned_graceful_replace_still_completes() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Slow(Duration::from_millis(200), "done"));
        let pipeline = pipeline(&provider, &transport, None, true);

        let invocation = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .invoke::<String>(request(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), pipeline.replace_peer()).await;
        assert!(abandoned.is_err());

        assert_eq!(invocation.await.unwrap().unwrap(), "done");

        let cancel = CancellationToken::new();
        let result: String = tokio::time::timeout(Duration::from_secs(2), pipeline.invoke(request(), &cancel))
            .await
            .expect("entry should reopen once the replacement finishes")
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(provider.retired(), 1);
        assert_eq!(transport.generations(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ungraceful_replace_does_not_wait() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::Hang);
        let pipeline = pipeline(&provider, &transport, None, false);

        let _invocation = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .invoke::<Value>(request(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), pipeline.replace_peer())
            .await
            .expect("ungraceful replacement should not wait")
            .unwrap();
        assert_eq!(provider.retired(), 1);
    }

    #[tokio::test]
    async fn test_dispose() {
        let provider = Arc::new(FakeProvider::new());
        let transport = replying(Reply::ok("text/plain", "ok"));
        let pipeline = pipeline(&provider, &transport, None, false);

        pipeline.dispose().await;
        pipeline.dispose().await;
        assert!(pipeline.is_disposed());
        assert!(provider.is_disposed());

        let err = pipeline
            .invoke::<String>(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
    }

    #[test]
    fn test_body_excerpt_truncates() {
        let long = "x".repeat(MAX_BODY_EXCERPT + 10);
        let excerpt = body_excerpt(long.as_bytes());
        assert_eq!(excerpt.len(), MAX_BODY_EXCERPT + 3);
        assert!(excerpt.ends_with("..."));
    }
}
