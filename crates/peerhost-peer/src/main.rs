//! peerhost reference peer.
//!
//! Runs Rhai modules for a peerhost host. The peer binds an HTTP port,
//! announces it with the handshake line on stdout, and exits when the parent
//! process goes away.

mod modules;
mod server;
mod watchdog;

use anyhow::Result;
use clap::Parser;
use modules::ModuleHost;
use peerhost::config::PeerConfig;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "peerhost-peer")]
#[command(about = "Rhai module peer for peerhost")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Exit when this process exits
    #[arg(long = "parentPid")]
    parent_pid: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Directory file modules are resolved against (defaults to the working directory)
    #[arg(long)]
    project_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The host forwards our stdout into its own log.
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .compact()
        .init();

    let project_root = match args.project_root {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    info!("Project root: {}", project_root.display());

    let host = Arc::new(ModuleHost::new(project_root));
    let addr = server::start_server(host, &args.host, args.port).await?;

    // Handshake line read by the supervising host.
    println!(
        "{} Listening on IP:{} Port:{}",
        PeerConfig::HANDSHAKE_MARKER,
        addr.ip(),
        addr.port()
    );
    std::io::stdout().flush()?;

    match args.parent_pid {
        Some(pid) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Shutdown signal received, exiting");
                }
                _ = watchdog::wait_for_parent_exit(pid) => {
                    info!("Parent {} is gone, exiting", pid);
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
        }
    }

    Ok(())
}
