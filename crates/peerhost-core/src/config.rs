//! Centralized configuration for peerhost.
//!
//! Constants describing the wire contract and defaults live on the unit
//! structs below. The option structs are what a caller fills in (in code or
//! from a JSON file) to build a [`PeerHost`](crate::PeerHost).

use crate::error::{PeerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Peer process and handshake configuration.
pub struct PeerConfig;

impl PeerConfig {
    /// Prefix of the line a peer prints once it accepts requests.
    pub const HANDSHAKE_MARKER: &'static str = "[peerhost]";
    pub const DEFAULT_EXECUTABLE: &'static str = "node";
    pub const PARENT_PID_ARG: &'static str = "--parentPid";
    pub const PORT_ARG: &'static str = "--port";
    pub const DEFAULT_CONNECTION_TIMEOUT_MS: i64 = 60_000;
    /// How long disposal waits for output readers to flush.
    pub const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);
    /// Tracing target used for lines forwarded from peer stdout/stderr.
    pub const LOG_TARGET: &'static str = "peerhost::peer";
}

/// Invocation and wire configuration.
pub struct InvocationConfig;

impl InvocationConfig {
    pub const DEFAULT_INVOCATION_TIMEOUT_MS: i64 = 60_000;
    /// Separator between metadata and raw bytes in a stream invocation body.
    pub const STREAM_BOUNDARY: &'static str = "--Uiw6r2dK";
    pub const USER_AGENT: &'static str = "peerhost/0.1";
    pub const CONTENT_TYPE_JSON: &'static str = "application/json";
    pub const CONTENT_TYPE_TEXT: &'static str = "text/plain";
    pub const CONTENT_TYPE_OCTET_STREAM: &'static str = "application/octet-stream";
    pub const CONTENT_TYPE_MULTIPART: &'static str = "multipart/mixed";
}

/// File watching configuration.
pub struct WatchConfig;

impl WatchConfig {
    pub const DEFAULT_DEBOUNCE_MS: u64 = 25;
    pub const DEFAULT_PATTERNS: &'static [&'static str] =
        &["*.js", "*.jsx", "*.ts", "*.tsx", "*.json", "*.html"];
}

/// How a [`PeerHost`](crate::PeerHost) distributes invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// A single supervised peer.
    #[default]
    None,
    /// A round-robin pool of supervised peers.
    MultiProcess,
}

/// HTTP protocol version spoken to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpVersion {
    #[default]
    #[serde(rename = "http1.1")]
    Http1_1,
    #[serde(rename = "http2")]
    Http2,
}

/// How to start a peer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Executable to run, resolved through PATH when not absolute.
    pub executable_path: String,
    /// Options for the runtime itself, placed before the entry arguments.
    pub runtime_options: Vec<String>,
    /// Entry arguments, typically the listener script.
    pub entry_args: Vec<String>,
    /// Working directory of the peer; relative module paths resolve against it.
    pub project_path: Option<PathBuf>,
    /// Extra environment variables for the peer.
    pub environment: HashMap<String, String>,
    /// Port the peer should listen on. 0 lets the OS choose.
    pub port: u16,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            executable_path: PeerConfig::DEFAULT_EXECUTABLE.to_string(),
            runtime_options: Vec::new(),
            entry_args: Vec::new(),
            project_path: None,
            environment: HashMap::new(),
            port: 0,
        }
    }
}

impl ProcessOptions {
    /// Create options for the given executable.
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
            ..Self::default()
        }
    }

    /// Add an entry argument.
    pub fn with_entry_arg(mut self, arg: impl Into<String>) -> Self {
        self.entry_args.push(arg.into());
        self
    }

    /// Add a runtime option.
    pub fn with_runtime_option(mut self, option: impl Into<String>) -> Self {
        self.runtime_options.push(option.into());
        self
    }

    /// Set the working directory.
    pub fn with_project_path(mut self, path: impl AsRef<Path>) -> Self {
        self.project_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Invocation, supervision and watching behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Round-trip limit per invocation. Values <= 0 wait indefinitely.
    pub invocation_timeout_ms: i64,
    /// Handshake limit when starting a peer. Values <= 0 wait indefinitely.
    pub connection_timeout_ms: i64,
    pub concurrency: Concurrency,
    /// Pool size for `MultiProcess`. Values <= 0 use the processor count.
    pub concurrency_degree: i32,
    /// Let in-flight invocations finish before killing a replaced peer.
    pub graceful_process_shutdown: bool,
    pub enable_file_watching: bool,
    /// Directory to watch. Defaults to the process project path.
    pub watch_path: Option<PathBuf>,
    pub watch_subdirectories: bool,
    pub watch_file_name_patterns: Vec<String>,
    pub watch_debounce_ms: u64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: InvocationConfig::DEFAULT_INVOCATION_TIMEOUT_MS,
            connection_timeout_ms: PeerConfig::DEFAULT_CONNECTION_TIMEOUT_MS,
            concurrency: Concurrency::None,
            concurrency_degree: 0,
            graceful_process_shutdown: true,
            enable_file_watching: false,
            watch_path: None,
            watch_subdirectories: true,
            watch_file_name_patterns: WatchConfig::DEFAULT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            watch_debounce_ms: WatchConfig::DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl ServiceOptions {
    /// Invocation timeout, or `None` when disabled.
    pub fn invocation_timeout(&self) -> Option<Duration> {
        positive_millis(self.invocation_timeout_ms)
    }

    /// Connection timeout, or `None` when disabled.
    pub fn connection_timeout(&self) -> Option<Duration> {
        positive_millis(self.connection_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// HTTP transport options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub version: HttpVersion,
}

/// Complete option snapshot for a [`PeerHost`](crate::PeerHost).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerHostOptions {
    pub process: ProcessOptions,
    pub service: ServiceOptions,
    pub http: HttpOptions,
}

impl PeerHostOptions {
    /// Parse options from a JSON string. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PeerError::Config {
            message: format!("Invalid options: {}", e),
        })
    }

    /// Load options from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| PeerError::io_with_path(e, path))?;
        Self::from_json_str(&contents)
    }

    /// Directory to watch when file watching is enabled.
    pub fn watch_root(&self) -> Option<PathBuf> {
        self.service
            .watch_path
            .clone()
            .or_else(|| self.process.project_path.clone())
            .or_else(|| std::env::current_dir().ok())
    }
}

fn positive_millis(ms: i64) -> Option<Duration> {
    if ms > 0 {
        Some(Duration::from_millis(ms as u64))
    } else {
        None
    }
}
