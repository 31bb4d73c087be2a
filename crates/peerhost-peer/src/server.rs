//! HTTP server implementation using Axum.

use crate::modules::{InvokeError, ModuleHost, ModuleOutput};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use peerhost::config::InvocationConfig;
use peerhost::InvocationMetadata;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Largest request body accepted, module source included.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Error body the host decodes into an invocation error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_message: String,
    error_stack: String,
}

/// Build the invocation router.
pub fn router(host: Arc<ModuleHost>) -> Router {
    Router::new()
        .route("/", post(handle_invoke))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

/// Start the invocation server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    host: Arc<ModuleHost>,
    bind: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(host);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

async fn handle_invoke(
    State(host): State<Arc<ModuleHost>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (metadata, stream) = match decode_request(&headers, body) {
        Ok(decoded) => decoded,
        Err(message) => {
            debug!("Rejecting request: {}", message);
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    // Scripts are synchronous and may run for a long time.
    let outcome = tokio::task::spawn_blocking(move || host.invoke(metadata, stream)).await;

    match outcome {
        Ok(Ok(output)) => output_response(output),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            error!("Invocation task failed: {}", e);
            script_failure(format!("Invocation task failed: {}", e), String::new())
        }
    }
}

/// Split a request body into metadata and optional stream bytes.
fn decode_request(
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(InvocationMetadata, Option<Bytes>), String> {
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with(InvocationConfig::CONTENT_TYPE_MULTIPART))
        .unwrap_or(false);

    if !is_multipart {
        let metadata = serde_json::from_slice(&body)
            .map_err(|e| format!("Invalid invocation metadata: {}", e))?;
        return Ok((metadata, None));
    }

    let boundary = InvocationConfig::STREAM_BOUNDARY.as_bytes();
    let split = body
        .windows(boundary.len())
        .position(|window| window == boundary)
        .ok_or_else(|| "Stream request without boundary".to_string())?;

    let metadata = serde_json::from_slice(&body[..split])
        .map_err(|e| format!("Invalid invocation metadata: {}", e))?;
    let stream = body.slice(split + boundary.len()..);
    Ok((metadata, Some(stream)))
}

fn output_response(output: ModuleOutput) -> Response {
    match output {
        ModuleOutput::Text(text) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        ModuleOutput::Binary(bytes) => (
            [(header::CONTENT_TYPE, InvocationConfig::CONTENT_TYPE_OCTET_STREAM)],
            bytes,
        )
            .into_response(),
        ModuleOutput::Json(value) => Json(value).into_response(),
    }
}

fn error_response(err: InvokeError) -> Response {
    match err {
        InvokeError::NotCached(key) => {
            debug!("Cache miss for `{}`", key);
            StatusCode::NOT_FOUND.into_response()
        }
        InvokeError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        InvokeError::Script { message, stack } => script_failure(message, stack),
    }
}

fn script_failure(message: String, stack: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error_message: message,
            error_stack: stack,
        }),
    )
        .into_response()
}
