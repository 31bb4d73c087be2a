//! Error types for peerhost.
//!
//! Every failure an invocation can surface maps to one `PeerError` variant.
//! Transport-level connection failures are not part of this taxonomy: they are
//! reported as [`TransportError`](crate::transport::TransportError) and consumed
//! by the pipeline's retry logic.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for peerhost.
#[derive(Debug, Error)]
pub enum PeerError {
    // Process lifecycle errors
    #[error("Failed to start peer process `{executable}`: {message}")]
    ProcessSpawnFailure {
        executable: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error(
        "Peer process did not announce its endpoint within {0:?}. \
         Increase `connection_timeout_ms` if the runtime is slow to start."
    )]
    ConnectionTimeout(Duration),

    // Invocation errors
    #[error("{message}")]
    InvocationTimeout {
        message: String,
        /// Configured timeout that elapsed.
        timeout: Duration,
    },

    #[error("Peer reported an error: {message}")]
    Invocation {
        message: String,
        /// Stack trace reported by the peer, if any.
        peer_stack: Option<String>,
    },

    #[error("Unexpected response from peer (status {status}): {message}")]
    Protocol { status: u16, message: String },

    #[error("Peer at {endpoint} is unavailable after retrying: {message}")]
    PeerUnavailable { endpoint: String, message: String },

    #[error("Invocation cancelled")]
    Cancelled,

    // Programming errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument {field}: {message}")]
    Argument { field: String, message: String },

    // File watching errors
    #[error("File watch error for {path:?}: {message}")]
    Watch { path: PathBuf, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for peerhost operations.
pub type Result<T> = std::result::Result<T, PeerError>;

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PeerError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PeerError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an argument validation error.
    pub fn argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        PeerError::Argument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if the caller can reasonably retry the failed call.
    ///
    /// Peer-reported errors are never retryable: the same module with the same
    /// arguments fails the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerError::ConnectionTimeout(_) | PeerError::PeerUnavailable { .. }
        )
    }

    /// Check if this error is an invocation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::InvocationTimeout { .. })
    }
}
