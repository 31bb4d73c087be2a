//! Transport seam between the pipeline and a peer's HTTP endpoint.
//!
//! [`HttpTransport`] is the production implementation. Tests substitute their
//! own [`Transport`] to script peer behaviour without spawning processes.

use crate::config::{HttpOptions, HttpVersion, InvocationConfig};
use crate::error::{PeerError, Result};
use crate::process::PeerEndpoint;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt;
use std::io;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

/// Response body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Encoded request body.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub content_type: &'static str,
    pub body: Bytes,
}

/// Raw peer response.
pub struct WireResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl WireResponse {
    /// Response with a fully buffered body.
    pub fn from_bytes(status: u16, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: Box::pin(stream::once(async move { Ok::<_, io::Error>(body) })),
        }
    }

    /// Media type without parameters, lowercased.
    pub fn media_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Collect the whole body.
    ///
    /// A body that breaks off midway means the peer went away.
    pub async fn collect(self) -> std::result::Result<Bytes, TransportError> {
        let mut buffer = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransportError::Unavailable(e.to_string()))?;
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer could not be reached or dropped the connection. The pipeline
    /// retries these once on a fresh peer.
    #[error("peer unreachable: {0}")]
    Unavailable(String),

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Sends encoded requests to a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &PeerEndpoint,
        request: WireRequest,
    ) -> std::result::Result<WireResponse, TransportError>;
}

/// HTTP/1.1 or HTTP/2 transport over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build the shared client.
    ///
    /// No request timeout is set here; the pipeline enforces the invocation
    /// timeout itself.
    pub fn new(options: &HttpOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(InvocationConfig::USER_AGENT)
            .no_proxy();
        if options.version == HttpVersion::Http2 {
            builder = builder.http2_prior_knowledge();
        }

        let client = builder.build().map_err(|e| PeerError::Config {
            message: format!("Failed to create HTTP client: {}", e),
        })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &PeerEndpoint,
        request: WireRequest,
    ) -> std::result::Result<WireResponse, TransportError> {
        debug!(
            "POST {} ({} bytes, {})",
            endpoint,
            request.body.len(),
            request.content_type
        );

        let response = self
            .client
            .post(endpoint.url().clone())
            .header(CONTENT_TYPE, request.content_type)
            .body(request.body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e));

        Ok(WireResponse {
            status,
            content_type,
            body: Box::pin(body),
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Unavailable(error_chain(&err))
    } else {
        TransportError::Failed(error_chain(&err))
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
