//! Peer process management.
//!
//! - `launcher`: builds the command line and spawns the process
//! - `handshake`: parses the endpoint announcement and forwards peer output
//! - `supervisor`: lazy start, death detection and replacement

mod handshake;
mod launcher;
mod supervisor;

pub use handshake::{is_benign_diagnostic, parse_handshake_line, PeerEndpoint};
pub use launcher::{spawn_failure, ProcessSpawner, SpawnSpec, TokioSpawner};
pub use supervisor::{PeerProcess, PeerProvider, PeerState, ProcessSupervisor};
