//! Pipeline and pool behavior over real HTTP against an in-process fake peer.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::TryStreamExt;
use peerhost::config::InvocationConfig;
use peerhost::{
    CancellationToken, HttpOptions, HttpTransport, InvocationMetadata, InvocationPipeline,
    InvocationRequest, InvocationService, PeerEndpoint, PeerError, PeerProvider, PipelineSettings,
    ProcessPool, SerdeJsonCodec, StreamSource,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers according to the module source it is sent.
async fn fake_peer(headers: HeaderMap, body: Bytes) -> Response {
    let multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(InvocationConfig::CONTENT_TYPE_MULTIPART));

    let boundary = InvocationConfig::STREAM_BOUNDARY.as_bytes();
    let (metadata_bytes, stream) = if multipart {
        let split = body
            .windows(boundary.len())
            .position(|window| window == boundary)
            .expect("multipart body without boundary");
        (body.slice(..split), Some(body.slice(split + boundary.len()..)))
    } else {
        (body.clone(), None)
    };
    let metadata: InvocationMetadata =
        serde_json::from_slice(&metadata_bytes).expect("metadata should decode");

    if let Some(stream) = stream {
        return Json(json!({
            "stream": String::from_utf8_lossy(&stream),
            "args": metadata.args,
        }))
        .into_response();
    }

    match metadata.module_source.as_deref().unwrap_or_default() {
        "text" => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "hello").into_response(),
        "json" => Json(json!({ "echo": metadata.args, "export": metadata.export_name })).into_response(),
        "empty" => StatusCode::OK.into_response(),
        "bytes" => (
            [(header::CONTENT_TYPE, InvocationConfig::CONTENT_TYPE_OCTET_STREAM)],
            vec![1u8, 2, 3],
        )
            .into_response(),
        "missing" => StatusCode::NOT_FOUND.into_response(),
        "fail" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "errorMessage": "boom", "errorStack": "at line 1" })),
        )
            .into_response(),
        "garbled" => (StatusCode::INTERNAL_SERVER_ERROR, "not json").into_response(),
        "teapot" => StatusCode::IM_A_TEAPOT.into_response(),
        "hang" => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            StatusCode::OK.into_response()
        }
        other => panic!("unexpected module source {other:?}"),
    }
}

async fn start_fake_peer() -> SocketAddr {
    let app = Router::new().route("/", post(fake_peer));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Hands out fixed addresses, advancing to the next one on discard.
struct StaticProvider {
    addrs: Vec<SocketAddr>,
    current: AtomicUsize,
}

impl StaticProvider {
    fn new(addrs: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            addrs,
            current: AtomicUsize::new(0),
        })
    }

    fn discarded(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerProvider for StaticProvider {
    async fn ensure_live_peer(&self) -> peerhost::Result<PeerEndpoint> {
        let index = self.current.load(Ordering::SeqCst);
        let addr = self.addrs[index.min(self.addrs.len() - 1)];
        PeerEndpoint::new(index as u64 + 1, addr)
    }

    async fn discard(&self, endpoint: &PeerEndpoint) {
        let _ = self.current.compare_exchange(
            endpoint.generation() as usize - 1,
            endpoint.generation() as usize,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    async fn retire(&self) {}

    async fn dispose(&self) {}
}

fn pipeline(provider: Arc<StaticProvider>, timeout: Option<Duration>) -> InvocationPipeline {
    InvocationPipeline::new(
        provider,
        Arc::new(HttpTransport::new(&HttpOptions::default()).unwrap()),
        Arc::new(SerdeJsonCodec),
        PipelineSettings {
            invocation_timeout: timeout,
            ..PipelineSettings::default()
        },
    )
}

#[tokio::test]
async fn test_text_and_json_results() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, None);
    let cancel = CancellationToken::new();

    let text: String = pipeline
        .invoke(InvocationRequest::from_string("text").unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(text, "hello");

    let echoed: Value = pipeline
        .invoke_from_string("json", None, Some("run"), vec![json!(1), json!("two")], &cancel)
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "echo": [1, "two"], "export": "run" }));

    let empty: Option<String> = pipeline
        .invoke(InvocationRequest::from_string("empty").unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(empty, None);
}

#[tokio::test]
async fn test_stream_request_is_multipart() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, None);
    let cancel = CancellationToken::new();

    let reply: Value = pipeline
        .invoke_from_stream(
            StreamSource::from_bytes(b"module body".to_vec()),
            None,
            None,
            vec![json!(7)],
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({ "stream": "module body", "args": [7] }));
}

#[tokio::test]
async fn test_octet_stream_is_passed_through() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, None);
    let cancel = CancellationToken::new();

    let stream = pipeline
        .invoke_stream(InvocationRequest::from_string("bytes").unwrap(), &cancel)
        .await
        .unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), vec![1u8, 2, 3]);

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("bytes").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol { status: 200, .. }));
}

#[tokio::test]
async fn test_error_statuses() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, None);
    let cancel = CancellationToken::new();

    let missing: Option<Value> = pipeline
        .try_invoke(InvocationRequest::from_string("missing").unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(missing, None);

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("missing").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol { status: 404, .. }));

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("fail").unwrap(), &cancel)
        .await
        .unwrap_err();
    match err {
        PeerError::Invocation { message, peer_stack } => {
            assert_eq!(message, "boom");
            assert_eq!(peer_stack.as_deref(), Some("at line 1"));
        }
        other => panic!("expected a peer error, got {other:?}"),
    }

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("garbled").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol { status: 500, ref message } if message == "not json"));

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("teapot").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol { status: 418, .. }));
}

#[tokio::test]
async fn test_unreachable_peer_is_retried_once() {
    let provider = StaticProvider::new(vec![dead_addr().await, start_fake_peer().await]);
    let pipeline = pipeline(Arc::clone(&provider), None);
    let cancel = CancellationToken::new();

    let text: String = pipeline
        .invoke(InvocationRequest::from_string("text").unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(text, "hello");
    assert_eq!(provider.discarded(), 1);
}

#[tokio::test]
async fn test_second_unreachable_peer_fails() {
    let provider = StaticProvider::new(vec![dead_addr().await, dead_addr().await]);
    let pipeline = pipeline(Arc::clone(&provider), None);
    let cancel = CancellationToken::new();

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("text").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::PeerUnavailable { .. }), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_hanging_peer_times_out() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, Some(Duration::from_millis(100)));
    let cancel = CancellationToken::new();

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("hang").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("never responded"));
}

#[tokio::test]
async fn test_cancellation_interrupts_a_call() {
    let provider = StaticProvider::new(vec![start_fake_peer().await]);
    let pipeline = pipeline(provider, None);
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = pipeline
        .invoke::<Value>(InvocationRequest::from_string("hang").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Cancelled));
}

#[tokio::test]
async fn test_pool_over_http() {
    let first = StaticProvider::new(vec![start_fake_peer().await]);
    let second = StaticProvider::new(vec![dead_addr().await, start_fake_peer().await]);
    let pool = ProcessPool::new(vec![
        pipeline(Arc::clone(&first), None),
        pipeline(Arc::clone(&second), None),
    ])
    .unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..4 {
        let text: String = pool
            .invoke(InvocationRequest::from_string("text").unwrap(), &cancel)
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }
    assert_eq!(first.discarded(), 0);
    assert_eq!(second.discarded(), 1);

    pool.dispose().await;
    let err = pool
        .invoke::<String>(InvocationRequest::from_string("text").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::InvalidState(_)));
}
