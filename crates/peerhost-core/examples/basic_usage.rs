//! Basic usage example - run a Rhai function in a supervised peer
//!
//! Build the reference peer first (`cargo build -p peerhost-peer`), then pass
//! its path: `cargo run --example basic_usage -- target/debug/peerhost-peer`

use peerhost::{CancellationToken, InvocationService, PeerHost, PeerHostOptions, ProcessOptions, Result};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().compact().init();

    let executable = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "peerhost-peer".to_string());

    println!("Starting peer: {}", executable);

    let mut options = PeerHostOptions::default();
    options.process = ProcessOptions::new(executable);
    let host = PeerHost::new(options)?;
    let cancel = CancellationToken::new();

    let sum: i64 = host
        .invoke_from_string(
            "fn add(a, b) { a + b }",
            Some("math"),
            Some("add"),
            vec![json!(1), json!(2)],
            &cancel,
        )
        .await?;
    println!("1 + 2 = {}", sum);

    let cached: Option<i64> = host
        .try_invoke_from_cache("math", Some("add"), vec![json!(40), json!(2)], &cancel)
        .await?;
    println!("cached add(40, 2) = {:?}", cached);

    println!("Peer pids: {:?}", host.peer_pids());
    host.dispose().await;
    Ok(())
}
