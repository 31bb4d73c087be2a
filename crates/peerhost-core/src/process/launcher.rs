//! Peer process launching.

use crate::config::{PeerConfig, ProcessOptions};
use crate::error::PeerError;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything needed to start one peer process.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    /// Executable to run.
    pub program: String,
    /// Runtime options, entry arguments, then the parent PID and port.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    /// Build the command line for a peer owned by `parent_pid`.
    pub fn from_options(options: &ProcessOptions, parent_pid: u32) -> Self {
        let mut args = Vec::with_capacity(options.runtime_options.len() + options.entry_args.len() + 4);
        args.extend(options.runtime_options.iter().cloned());
        args.extend(options.entry_args.iter().cloned());
        args.push(PeerConfig::PARENT_PID_ARG.to_string());
        args.push(parent_pid.to_string());
        args.push(PeerConfig::PORT_ARG.to_string());
        args.push(options.port.to_string());

        Self {
            program: options.executable_path.clone(),
            args,
            working_dir: options.project_path.clone(),
            env: options.environment.clone(),
        }
    }

    /// Command line for log messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts peer processes.
///
/// Implementations must capture stdout and stderr; the supervisor reads the
/// handshake from stdout.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<Child>;
}

/// Spawns peers with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<Child> {
        debug!("Spawning peer: {}", spec.command_line());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        command.spawn()
    }
}

/// Turn a spawn failure into an error that tells the user how to fix it.
pub fn spawn_failure(spec: &SpawnSpec, err: io::Error) -> PeerError {
    let working_dir = spec
        .working_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "<current directory>".to_string());

    let message = if err.kind() == io::ErrorKind::NotFound {
        format!(
            "the executable could not be found (working directory: {}). \
             Install the runtime, add its directory to PATH, \
             or set `process.executable_path` to the absolute path of the executable",
            working_dir
        )
    } else {
        format!(
            "{} (working directory: {}). Check that the executable has execute \
             permission and that the working directory exists",
            err, working_dir
        )
    };

    PeerError::ProcessSpawnFailure {
        executable: spec.program.clone(),
        message,
        source: Some(err),
    }
}
