//! API construction.
//!
//! The [`PeerHost`](crate::PeerHost) type lives in `lib.rs`; this module
//! holds the builder that wires supervisors, transport and pipelines together.

mod builder;

pub use builder::PeerHostBuilder;
