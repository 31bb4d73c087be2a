//! Invocation request model and its wire encoding.

use crate::codec::{encode_typed, JsonCodec};
use crate::config::InvocationConfig;
use crate::error::{PeerError, Result};
use crate::transport::WireRequest;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Where the peer finds the module to run.
///
/// Serialized as its ordinal, which is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ModuleSourceKind {
    /// A module the peer cached under `module_source`.
    Cache = 0,
    /// A file path resolved by the peer.
    File = 1,
    /// Module source text.
    String = 2,
    /// Module source sent as raw bytes after the metadata.
    Stream = 3,
}

impl From<ModuleSourceKind> for u8 {
    fn from(kind: ModuleSourceKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for ModuleSourceKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cache),
            1 => Ok(Self::File),
            2 => Ok(Self::String),
            3 => Ok(Self::Stream),
            other => Err(format!("unknown module source type {}", other)),
        }
    }
}

/// Anything a stream module can be read from.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// Raw module bytes for a [`ModuleSourceKind::Stream`] invocation.
///
/// Readers are rewound to the position they had on first use before a
/// retried invocation resends them.
pub struct StreamSource {
    inner: StreamInner,
    start: Option<u64>,
}

enum StreamInner {
    Bytes(Bytes),
    Reader(Box<dyn SeekableRead>),
}

impl StreamSource {
    /// Stream from an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: StreamInner::Bytes(bytes.into()),
            start: None,
        }
    }

    /// Stream from a seekable reader, such as a `tokio::fs::File`.
    pub fn from_reader<R: SeekableRead + 'static>(reader: R) -> Self {
        Self {
            inner: StreamInner::Reader(Box::new(reader)),
            start: None,
        }
    }

    /// Read the remaining bytes, starting over from the original position if
    /// the source was read before.
    pub(crate) async fn read_all(&mut self) -> std::io::Result<Bytes> {
        let Self { inner, start } = self;
        match inner {
            StreamInner::Bytes(bytes) => Ok(bytes.clone()),
            StreamInner::Reader(reader) => {
                match start {
                    Some(position) => {
                        reader.seek(SeekFrom::Start(*position)).await?;
                    }
                    None => *start = Some(reader.stream_position().await?),
                }
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            StreamInner::Bytes(bytes) => write!(f, "StreamSource::Bytes({} bytes)", bytes.len()),
            StreamInner::Reader(_) => write!(f, "StreamSource::Reader(start: {:?})", self.start),
        }
    }
}

/// Metadata sent to the peer for every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetadata {
    pub module_source_type: ModuleSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One call into a peer.
#[derive(Debug)]
pub struct InvocationRequest {
    kind: ModuleSourceKind,
    module_source: Option<String>,
    cache_identifier: Option<String>,
    export_name: Option<String>,
    args: Vec<Value>,
    stream_source: Option<StreamSource>,
}

impl InvocationRequest {
    /// Create a validated request.
    ///
    /// Stream requests need a stream source; every other kind needs a
    /// non-empty module source.
    pub fn new(
        kind: ModuleSourceKind,
        module_source: Option<String>,
        stream_source: Option<StreamSource>,
    ) -> Result<Self> {
        match kind {
            ModuleSourceKind::Stream => {
                if stream_source.is_none() {
                    return Err(PeerError::argument(
                        "stream_source",
                        "a stream invocation needs a stream source",
                    ));
                }
            }
            _ => {
                if module_source.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    return Err(PeerError::argument(
                        "module_source",
                        "must not be empty for cache, file and string invocations",
                    ));
                }
            }
        }

        Ok(Self {
            kind,
            module_source,
            cache_identifier: None,
            export_name: None,
            args: Vec::new(),
            stream_source,
        })
    }

    /// Invoke a module file. Relative paths resolve against the peer's working directory.
    pub fn from_file(module_path: impl Into<String>) -> Result<Self> {
        Self::new(ModuleSourceKind::File, Some(module_path.into()), None)
    }

    /// Invoke module source text.
    pub fn from_string(module_source: impl Into<String>) -> Result<Self> {
        Self::new(ModuleSourceKind::String, Some(module_source.into()), None)
    }

    /// Invoke a module the peer cached earlier.
    pub fn from_cache(cache_identifier: impl Into<String>) -> Result<Self> {
        Self::new(ModuleSourceKind::Cache, Some(cache_identifier.into()), None)
    }

    /// Invoke module source read from a stream.
    pub fn from_stream(stream: StreamSource) -> Self {
        Self {
            kind: ModuleSourceKind::Stream,
            module_source: None,
            cache_identifier: None,
            export_name: None,
            args: Vec::new(),
            stream_source: Some(stream),
        }
    }

    /// Rebuild a request from decoded metadata.
    pub fn from_metadata(metadata: InvocationMetadata, stream: Option<StreamSource>) -> Result<Self> {
        let mut request = Self::new(metadata.module_source_type, metadata.module_source, stream)?;
        request.cache_identifier = metadata.cache_identifier;
        request.export_name = metadata.export_name;
        request.args = metadata.args;
        Ok(request)
    }

    /// Ask the peer to cache the module under this identifier.
    pub fn with_cache_identifier(mut self, cache_identifier: impl Into<String>) -> Self {
        self.cache_identifier = Some(cache_identifier.into());
        self
    }

    /// Call a named export instead of the module's default behaviour.
    pub fn with_export_name(mut self, export_name: impl Into<String>) -> Self {
        self.export_name = Some(export_name.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kind(&self) -> ModuleSourceKind {
        self.kind
    }

    pub fn module_source(&self) -> Option<&str> {
        self.module_source.as_deref()
    }

    pub fn cache_identifier(&self) -> Option<&str> {
        self.cache_identifier.as_deref()
    }

    pub fn export_name(&self) -> Option<&str> {
        self.export_name.as_deref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Metadata as sent on the wire.
    pub fn metadata(&self) -> InvocationMetadata {
        InvocationMetadata {
            module_source_type: self.kind,
            module_source: self.module_source.clone(),
            cache_identifier: self.cache_identifier.clone(),
            export_name: self.export_name.clone(),
            args: self.args.clone(),
        }
    }

    /// Encode the request body.
    ///
    /// Stream requests become metadata, the boundary marker and the raw
    /// bytes; everything else is a JSON body. Calling this again re-reads the
    /// stream from its original position.
    pub(crate) async fn encode(&mut self, codec: &dyn JsonCodec) -> Result<WireRequest> {
        let metadata = encode_typed(codec, &self.metadata())?;

        match self.stream_source.as_mut() {
            Some(stream) => {
                let payload = stream.read_all().await?;
                let boundary = InvocationConfig::STREAM_BOUNDARY.as_bytes();
                let mut body = BytesMut::with_capacity(metadata.len() + boundary.len() + payload.len());
                body.put_slice(&metadata);
                body.put_slice(boundary);
                body.put_slice(&payload);
                Ok(WireRequest {
                    content_type: InvocationConfig::CONTENT_TYPE_MULTIPART,
                    body: body.freeze(),
                })
            }
            None => Ok(WireRequest {
                content_type: InvocationConfig::CONTENT_TYPE_JSON,
                body: Bytes::from(metadata),
            }),
        }
    }
}
